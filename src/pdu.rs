//! Protocol Data Unit Carrier
//!
//! A [`Pdu`] owns a payload plus its source and destination endpoints and
//! the opaque BACnet control bits. Endpoints are either typed [`Address`]es
//! (above the multiplexer) or raw (ip, port) tuples (below it); payloads
//! are either opaque octets or a typed BVLL frame, depending on which side
//! of the Annex J codec the PDU travels.

use std::fmt;
use std::net::SocketAddrV4;

use bitflags::bitflags;
use bytes::Bytes;

use crate::address::Address;
use crate::bvll::BvllFrame;

bitflags! {
    /// Opaque BACnet control bits carried with every PDU.
    ///
    /// Layers never interpret these; they are copied verbatim whenever one
    /// PDU is derived from another.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PduFlags: u8 {
        /// Network priority, urgent bit.
        const PRIORITY_URGENT = 0b0000_0001;
        /// Network priority, critical-equipment bit.
        const PRIORITY_CRITICAL = 0b0000_0010;
        /// The sender expects a reply to this PDU.
        const EXPECTING_REPLY = 0b0000_0100;
    }
}

impl Default for PduFlags {
    fn default() -> Self {
        PduFlags::empty()
    }
}

/// A PDU endpoint: a typed address or a raw network tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Address(Address),
    Tuple(SocketAddrV4),
}

impl Endpoint {
    pub fn address(&self) -> Option<&Address> {
        match self {
            Endpoint::Address(addr) => Some(addr),
            Endpoint::Tuple(_) => None,
        }
    }

    pub fn tuple(&self) -> Option<SocketAddrV4> {
        match self {
            Endpoint::Tuple(tuple) => Some(*tuple),
            Endpoint::Address(_) => None,
        }
    }
}

impl From<Address> for Endpoint {
    fn from(addr: Address) -> Self {
        Endpoint::Address(addr)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(tuple: SocketAddrV4) -> Self {
        Endpoint::Tuple(tuple)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Address(addr) => write!(f, "{}", addr),
            Endpoint::Tuple(tuple) => write!(f, "{}", tuple),
        }
    }
}

/// A PDU payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Opaque octets: an NPDU above the BIP layers, wire octets below the
    /// codec.
    Raw(Bytes),
    /// A typed BVLL frame, between the BIP layers and the codec.
    Bvll(BvllFrame),
}

impl Payload {
    pub fn raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(data) => Some(data),
            Payload::Bvll(_) => None,
        }
    }

    pub fn bvll(&self) -> Option<&BvllFrame> {
        match self {
            Payload::Bvll(frame) => Some(frame),
            Payload::Raw(_) => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Payload::Raw(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(data))
    }
}

impl From<BvllFrame> for Payload {
    fn from(frame: BvllFrame) -> Self {
        Payload::Bvll(frame)
    }
}

/// Carrier for a payload, its endpoints and the opaque metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub payload: Payload,
    pub flags: PduFlags,
}

impl Pdu {
    /// A PDU with null endpoints and default control bits.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            source: Endpoint::Address(Address::Null),
            destination: Endpoint::Address(Address::Null),
            payload: payload.into(),
            flags: PduFlags::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<Endpoint>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<Endpoint>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_flags(mut self, flags: PduFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Derive a PDU from another: the control bits carry over, the payload
    /// and endpoints are replaced.
    pub fn derived_from(
        other: &Pdu,
        payload: impl Into<Payload>,
        source: impl Into<Endpoint>,
        destination: impl Into<Endpoint>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            payload: payload.into(),
            flags: other.flags,
        }
    }
}
