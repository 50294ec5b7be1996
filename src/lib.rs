#![doc = include_str!("../README.md")]

pub mod address;
pub mod bip;
pub mod bvll;
pub mod clock;
pub mod comm;
pub mod harness;
pub mod iocb;
pub mod mux;
pub mod pdu;
pub mod runtime;
pub mod util;
pub mod vlan;

// Re-export main types without glob imports to avoid conflicts
pub use address::{Address, AddressError};
pub use bvll::{AnnexJCodec, BvllFrame, BvllFunction, CodecError, ResultCode};
pub use comm::{Layer, Stack, StackError};
pub use mux::UdpMultiplexer;
pub use pdu::{Endpoint, Payload, Pdu, PduFlags};

/// BACnet/IP well-known UDP port (0xBAC0).
pub const BACNET_IP_PORT: u16 = 47808;
