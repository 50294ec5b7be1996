//! BACnet Virtual Link Layer (Annex J)
//!
//! This module implements the BVLL framing used by BACnet/IP: a four-octet
//! header (type 0x81, function code, big-endian total length) followed by a
//! function-specific payload. All twelve Annex J functions are covered,
//! including the broadcast-distribution-table and foreign-device-table
//! management frames a BBMD speaks.
//!
//! # Frame layout
//!
//! | Octet | Meaning |
//! |-------|---------|
//! | 0 | BVLL type, always 0x81 for BACnet/IP |
//! | 1 | Function code |
//! | 2-3 | Total length in octets, including this header |
//! | 4.. | Function-specific payload |
//!
//! Decoding is strict: a wrong type octet, a declared length that
//! disagrees with the actual octet count, or a malformed payload rejects
//! the frame. An unknown function code is its own error so the codec layer
//! can answer it with `Result 0x0001`.

use std::net::SocketAddrV4;

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use thiserror::Error;

use crate::address::{pack_ip_addr, prefix_mask, unpack_ip_addr, Address};
use crate::comm::{Effects, Layer, StackError};
use crate::pdu::{Payload, Pdu};

/// BVLL type octet for BACnet/IP.
pub const BVLL_TYPE_BIP: u8 = 0x81;

/// BVLL header size in octets.
pub const BVLL_HEADER_SIZE: usize = 4;

/// Maximum BVLL frame length.
pub const MAX_BVLL_LENGTH: usize = 1497;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding BVLL frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer octets than a BVLL header.
    #[error("BVLL frame truncated at {0} octets")]
    Truncated(usize),
    /// The type octet is not 0x81.
    #[error("invalid BVLL type 0x{0:02X}")]
    InvalidType(u8),
    /// The length field disagrees with the octets on the wire.
    #[error("declared length {declared} disagrees with actual {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    /// The function code is not an Annex J function.
    #[error("unknown BVLL function 0x{0:02X}")]
    UnknownFunction(u8),
    /// The function is known but its payload is malformed.
    #[error("invalid {function} payload: {reason}")]
    InvalidPayload {
        function: BvllFunction,
        reason: &'static str,
    },
}

/// BVLL function codes for BACnet/IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BvllFunction {
    /// Result of an operation
    Result = 0x00,
    /// Replace the receiver's broadcast distribution table
    WriteBroadcastDistributionTable = 0x01,
    /// Read the broadcast distribution table
    ReadBroadcastDistributionTable = 0x02,
    /// Acknowledge read BDT
    ReadBroadcastDistributionTableAck = 0x03,
    /// NPDU forwarded on behalf of its original sender
    ForwardedNpdu = 0x04,
    /// Register as foreign device
    RegisterForeignDevice = 0x05,
    /// Read the foreign device table
    ReadForeignDeviceTable = 0x06,
    /// Acknowledge read FDT
    ReadForeignDeviceTableAck = 0x07,
    /// Delete a foreign device table entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Ask a BBMD to distribute a broadcast
    DistributeBroadcastToNetwork = 0x09,
    /// Pass NPDU to a single device
    OriginalUnicastNpdu = 0x0A,
    /// Broadcast NPDU on the local network
    OriginalBroadcastNpdu = 0x0B,
}

impl BvllFunction {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::WriteBroadcastDistributionTable),
            0x02 => Some(Self::ReadBroadcastDistributionTable),
            0x03 => Some(Self::ReadBroadcastDistributionTableAck),
            0x04 => Some(Self::ForwardedNpdu),
            0x05 => Some(Self::RegisterForeignDevice),
            0x06 => Some(Self::ReadForeignDeviceTable),
            0x07 => Some(Self::ReadForeignDeviceTableAck),
            0x08 => Some(Self::DeleteForeignDeviceTableEntry),
            0x09 => Some(Self::DistributeBroadcastToNetwork),
            0x0A => Some(Self::OriginalUnicastNpdu),
            0x0B => Some(Self::OriginalBroadcastNpdu),
            _ => None,
        }
    }
}

impl std::fmt::Display for BvllFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

crate::wire_code_enum! {
    /// BVLL result codes.
    ///
    /// The standard names a success code and one NAK per management
    /// request; anything else (such as the synthetic 0xFFFF a foreign
    /// device reports on registration timeout) is carried in `Other`.
    ResultCode(u16) {
        /// Successful completion.
        Success = 0x0000,
        /// The receiver does not implement the requested function.
        UnknownFunction = 0x0001,
        /// Write-Broadcast-Distribution-Table NAK.
        WriteBdtNak = 0x0010,
        /// Read-Broadcast-Distribution-Table NAK.
        ReadBdtNak = 0x0020,
        /// Register-Foreign-Device NAK.
        RegisterForeignDeviceNak = 0x0030,
        /// Read-Foreign-Device-Table NAK.
        ReadFdtNak = 0x0040,
        /// Delete-Foreign-Device-Table-Entry NAK.
        DeleteFdtEntryNak = 0x0050,
        /// Distribute-Broadcast-To-Network NAK.
        DistributeBroadcastNak = 0x0060,
    }
}

/// One broadcast distribution table entry: a peer BBMD and its
/// distribution mask. Ten octets on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BdtEntry {
    pub address: SocketAddrV4,
    pub mask: std::net::Ipv4Addr,
}

impl BdtEntry {
    pub fn new(address: SocketAddrV4, mask: std::net::Ipv4Addr) -> Self {
        Self { address, mask }
    }

    /// A peer entry with an all-ones mask (the two-hop configuration).
    pub fn host(address: SocketAddrV4) -> Self {
        Self {
            address,
            mask: std::net::Ipv4Addr::BROADCAST,
        }
    }

    /// A peer entry with a mask derived from a prefix length.
    pub fn with_prefix(address: SocketAddrV4, prefix: u8) -> Self {
        Self {
            address,
            mask: std::net::Ipv4Addr::from(prefix_mask(prefix)),
        }
    }

    /// Where a Forwarded-NPDU for this peer is sent: the peer's address
    /// with the host bits of its mask raised. An all-ones mask means a
    /// plain unicast to the peer.
    pub fn forward_address(&self) -> SocketAddrV4 {
        let ip = u32::from(*self.address.ip()) | !u32::from(self.mask);
        SocketAddrV4::new(std::net::Ipv4Addr::from(ip), self.address.port())
    }

    /// A distribution mask must have contiguous ones.
    pub fn mask_is_valid(&self) -> bool {
        let mask = u32::from(self.mask);
        mask.count_ones() == mask.leading_ones()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&pack_ip_addr(self.address));
        buf.put_slice(&self.mask.octets());
    }

    fn decode(chunk: &[u8]) -> Self {
        let address = unpack_ip_addr(&chunk[..6]).expect("six octets");
        let mask =
            std::net::Ipv4Addr::new(chunk[6], chunk[7], chunk[8], chunk[9]);
        Self { address, mask }
    }
}

/// One foreign device table entry as reported in a Read-FDT Ack: the
/// device, its requested TTL and the seconds left before expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FdtEntry {
    pub address: SocketAddrV4,
    pub ttl: u16,
    pub remaining: u16,
}

impl FdtEntry {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&pack_ip_addr(self.address));
        buf.put_u16(self.ttl);
        buf.put_u16(self.remaining);
    }

    fn decode(chunk: &[u8]) -> Self {
        let address = unpack_ip_addr(&chunk[..6]).expect("six octets");
        let ttl = u16::from_be_bytes([chunk[6], chunk[7]]);
        let remaining = u16::from_be_bytes([chunk[8], chunk[9]]);
        Self {
            address,
            ttl,
            remaining,
        }
    }
}

/// A decoded BVLL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvllFrame {
    Result(ResultCode),
    WriteBroadcastDistributionTable(Vec<BdtEntry>),
    ReadBroadcastDistributionTable,
    ReadBroadcastDistributionTableAck(Vec<BdtEntry>),
    ForwardedNpdu { origin: SocketAddrV4, npdu: Bytes },
    RegisterForeignDevice { ttl: u16 },
    ReadForeignDeviceTable,
    ReadForeignDeviceTableAck(Vec<FdtEntry>),
    DeleteForeignDeviceTableEntry { address: SocketAddrV4 },
    DistributeBroadcastToNetwork(Bytes),
    OriginalUnicastNpdu(Bytes),
    OriginalBroadcastNpdu(Bytes),
}

impl BvllFrame {
    pub fn function(&self) -> BvllFunction {
        match self {
            BvllFrame::Result(_) => BvllFunction::Result,
            BvllFrame::WriteBroadcastDistributionTable(_) => {
                BvllFunction::WriteBroadcastDistributionTable
            }
            BvllFrame::ReadBroadcastDistributionTable => {
                BvllFunction::ReadBroadcastDistributionTable
            }
            BvllFrame::ReadBroadcastDistributionTableAck(_) => {
                BvllFunction::ReadBroadcastDistributionTableAck
            }
            BvllFrame::ForwardedNpdu { .. } => BvllFunction::ForwardedNpdu,
            BvllFrame::RegisterForeignDevice { .. } => BvllFunction::RegisterForeignDevice,
            BvllFrame::ReadForeignDeviceTable => BvllFunction::ReadForeignDeviceTable,
            BvllFrame::ReadForeignDeviceTableAck(_) => BvllFunction::ReadForeignDeviceTableAck,
            BvllFrame::DeleteForeignDeviceTableEntry { .. } => {
                BvllFunction::DeleteForeignDeviceTableEntry
            }
            BvllFrame::DistributeBroadcastToNetwork(_) => {
                BvllFunction::DistributeBroadcastToNetwork
            }
            BvllFrame::OriginalUnicastNpdu(_) => BvllFunction::OriginalUnicastNpdu,
            BvllFrame::OriginalBroadcastNpdu(_) => BvllFunction::OriginalBroadcastNpdu,
        }
    }

    /// Encode the frame, header included.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            BvllFrame::Result(code) => payload.put_u16(u16::from(*code)),
            BvllFrame::WriteBroadcastDistributionTable(entries)
            | BvllFrame::ReadBroadcastDistributionTableAck(entries) => {
                for entry in entries {
                    entry.encode_into(&mut payload);
                }
            }
            BvllFrame::ReadBroadcastDistributionTable | BvllFrame::ReadForeignDeviceTable => {}
            BvllFrame::ForwardedNpdu { origin, npdu } => {
                payload.put_slice(&pack_ip_addr(*origin));
                payload.put_slice(npdu);
            }
            BvllFrame::RegisterForeignDevice { ttl } => payload.put_u16(*ttl),
            BvllFrame::ReadForeignDeviceTableAck(entries) => {
                for entry in entries {
                    entry.encode_into(&mut payload);
                }
            }
            BvllFrame::DeleteForeignDeviceTableEntry { address } => {
                payload.put_slice(&pack_ip_addr(*address));
            }
            BvllFrame::DistributeBroadcastToNetwork(npdu)
            | BvllFrame::OriginalUnicastNpdu(npdu)
            | BvllFrame::OriginalBroadcastNpdu(npdu) => payload.put_slice(npdu),
        }

        let mut frame = BytesMut::with_capacity(BVLL_HEADER_SIZE + payload.len());
        frame.put_u8(BVLL_TYPE_BIP);
        frame.put_u8(self.function() as u8);
        frame.put_u16((BVLL_HEADER_SIZE + payload.len()) as u16);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Decode a frame, rejecting anything that is not exactly one valid
    /// BVLL frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BVLL_HEADER_SIZE {
            return Err(CodecError::Truncated(data.len()));
        }
        if data[0] != BVLL_TYPE_BIP {
            return Err(CodecError::InvalidType(data[0]));
        }
        let declared = u16::from_be_bytes([data[2], data[3]]);
        if declared as usize != data.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        let function =
            BvllFunction::from_u8(data[1]).ok_or(CodecError::UnknownFunction(data[1]))?;
        let body = &data[BVLL_HEADER_SIZE..];

        let malformed = |reason| CodecError::InvalidPayload { function, reason };

        match function {
            BvllFunction::Result => {
                if body.len() != 2 {
                    return Err(malformed("expected a two-octet result code"));
                }
                let code = u16::from_be_bytes([body[0], body[1]]);
                Ok(BvllFrame::Result(ResultCode::from(code)))
            }
            BvllFunction::WriteBroadcastDistributionTable
            | BvllFunction::ReadBroadcastDistributionTableAck => {
                if body.len() % 10 != 0 {
                    return Err(malformed("entries are ten octets each"));
                }
                let entries = body.chunks_exact(10).map(BdtEntry::decode).collect();
                Ok(match function {
                    BvllFunction::WriteBroadcastDistributionTable => {
                        BvllFrame::WriteBroadcastDistributionTable(entries)
                    }
                    _ => BvllFrame::ReadBroadcastDistributionTableAck(entries),
                })
            }
            BvllFunction::ReadBroadcastDistributionTable => {
                if !body.is_empty() {
                    return Err(malformed("expected an empty payload"));
                }
                Ok(BvllFrame::ReadBroadcastDistributionTable)
            }
            BvllFunction::ForwardedNpdu => {
                if body.len() < 6 {
                    return Err(malformed("missing six-octet origin address"));
                }
                let origin = unpack_ip_addr(&body[..6]).expect("six octets");
                Ok(BvllFrame::ForwardedNpdu {
                    origin,
                    npdu: Bytes::copy_from_slice(&body[6..]),
                })
            }
            BvllFunction::RegisterForeignDevice => {
                if body.len() != 2 {
                    return Err(malformed("expected a two-octet TTL"));
                }
                Ok(BvllFrame::RegisterForeignDevice {
                    ttl: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            BvllFunction::ReadForeignDeviceTable => {
                if !body.is_empty() {
                    return Err(malformed("expected an empty payload"));
                }
                Ok(BvllFrame::ReadForeignDeviceTable)
            }
            BvllFunction::ReadForeignDeviceTableAck => {
                if body.len() % 10 != 0 {
                    return Err(malformed("entries are ten octets each"));
                }
                Ok(BvllFrame::ReadForeignDeviceTableAck(
                    body.chunks_exact(10).map(FdtEntry::decode).collect(),
                ))
            }
            BvllFunction::DeleteForeignDeviceTableEntry => {
                if body.len() != 6 {
                    return Err(malformed("expected a six-octet address"));
                }
                Ok(BvllFrame::DeleteForeignDeviceTableEntry {
                    address: unpack_ip_addr(body).expect("six octets"),
                })
            }
            BvllFunction::DistributeBroadcastToNetwork => Ok(
                BvllFrame::DistributeBroadcastToNetwork(Bytes::copy_from_slice(body)),
            ),
            BvllFunction::OriginalUnicastNpdu => {
                Ok(BvllFrame::OriginalUnicastNpdu(Bytes::copy_from_slice(body)))
            }
            BvllFunction::OriginalBroadcastNpdu => Ok(BvllFrame::OriginalBroadcastNpdu(
                Bytes::copy_from_slice(body),
            )),
        }
    }
}

/// The Annex J codec as a stack layer.
///
/// Downward it serializes typed frames into wire octets; upward it parses
/// octets into frames. A malformed inbound frame is logged and, when its
/// source is known, answered with `Result 0x0001`; otherwise it is
/// dropped.
#[derive(Debug, Default)]
pub struct AnnexJCodec;

impl AnnexJCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Layer for AnnexJCodec {
    fn name(&self) -> &'static str {
        "annexj"
    }

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> std::result::Result<(), StackError> {
        let Payload::Bvll(frame) = &pdu.payload else {
            return Err(StackError::UnexpectedPayload(self.name()));
        };
        let encoded = frame.encode();
        fx.request(Pdu::derived_from(
            &pdu,
            encoded,
            pdu.source.clone(),
            pdu.destination.clone(),
        ));
        Ok(())
    }

    fn confirmation(
        &mut self,
        pdu: Pdu,
        fx: &mut Effects<'_>,
    ) -> std::result::Result<(), StackError> {
        let Payload::Raw(data) = &pdu.payload else {
            return Err(StackError::UnexpectedPayload(self.name()));
        };
        match BvllFrame::decode(data) {
            Ok(frame) => {
                fx.response(Pdu::derived_from(
                    &pdu,
                    frame,
                    pdu.source.clone(),
                    pdu.destination.clone(),
                ));
                Ok(())
            }
            Err(err) => {
                warn!(
                    "malformed BVLL frame from {}: {} [{}]",
                    pdu.source,
                    err,
                    hex::encode(data)
                );
                if let Some(source) = pdu.source.address().filter(|a| **a != Address::Null) {
                    let reply = BvllFrame::Result(ResultCode::UnknownFunction).encode();
                    fx.request(Pdu::derived_from(
                        &pdu,
                        reply,
                        pdu.destination.clone(),
                        source.clone(),
                    ));
                }
                Ok(())
            }
        }
    }
}
