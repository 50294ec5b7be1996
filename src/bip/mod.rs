//! BACnet/IP Node Roles
//!
//! This module implements the three BVLL service variants a BACnet/IP node
//! can run, plus the broadcast-distribution and foreign-device tables the
//! BBMD role maintains.
//!
//! # Roles
//!
//! ## Simple
//! An ordinary node: original unicast/broadcast NPDUs only. Every
//! BBMD-management request is answered with the matching NAK result.
//!
//! ## Foreign
//! A node on a subnet without a BBMD. It registers with a remote BBMD,
//! renews the registration before the TTL runs out, and sends its
//! broadcasts as Distribute-Broadcast-To-Network requests.
//!
//! ## BBMD
//! A broadcast management device: re-originates local broadcasts on peer
//! subnets via its broadcast distribution table and feeds registered
//! foreign devices from its foreign device table.

use std::net::SocketAddrV4;
use std::time::Duration;

use thiserror::Error;

use crate::bvll::{BdtEntry, BvllFunction, FdtEntry, ResultCode};
use crate::comm::StackError;
use crate::pdu::Pdu;

/// Simple BACnet/IP node.
pub mod simple;

/// Foreign-device registration state machine.
pub mod foreign;

/// BBMD: BDT/FDT maintenance and broadcast redistribution.
pub mod bbmd;

pub use bbmd::BipBbmd;
pub use foreign::{BipForeign, RegistrationState};
pub use simple::BipSimple;

/// Grace seconds added on top of a foreign device's requested TTL.
pub const REGISTRATION_GRACE_SECS: u32 = 30;

/// Interval of the BBMD's FDT expiry tick.
pub const FDT_TICK: Duration = Duration::from_secs(1);

/// Registration retransmit delays; the last value caps the schedule.
pub const REGISTRATION_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

/// Initial transmit plus retransmits before a registration gives up.
pub const MAX_REGISTRATION_ATTEMPTS: u8 = 4;

/// Synthetic result code surfaced when registration times out without any
/// answer from the BBMD.
pub const REGISTRATION_TIMEOUT_CODE: u16 = 0xFFFF;

/// Errors raised by table maintenance and role configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BipError {
    /// BDT addresses must be unique.
    #[error("duplicate BDT entry {0}")]
    DuplicateEntry(SocketAddrV4),
    /// Distribution masks must have contiguous ones.
    #[error("non-contiguous distribution mask on {0}")]
    InvalidMask(SocketAddrV4),
    /// Foreign-device TTLs are 1..=65535 seconds.
    #[error("ttl must be 1..=65535 seconds")]
    InvalidTtl,
}

/// The broadcast distribution table of a BBMD.
///
/// The owning BBMD is always the first entry, with an all-ones mask; peer
/// entries are kept in insertion order, which is also redistribution
/// order.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BroadcastDistributionTable {
    own: SocketAddrV4,
    entries: Vec<BdtEntry>,
}

impl BroadcastDistributionTable {
    pub fn new(own: SocketAddrV4) -> Self {
        Self {
            own,
            entries: vec![BdtEntry::host(own)],
        }
    }

    pub fn own_address(&self) -> SocketAddrV4 {
        self.own
    }

    pub fn entries(&self) -> &[BdtEntry] {
        &self.entries
    }

    /// Every entry other than the owning BBMD.
    pub fn peers(&self) -> impl Iterator<Item = &BdtEntry> + '_ {
        let own = self.own;
        self.entries.iter().filter(move |e| e.address != own)
    }

    pub fn contains(&self, address: SocketAddrV4) -> bool {
        self.entries.iter().any(|e| e.address == address)
    }

    pub fn add_peer(&mut self, entry: BdtEntry) -> Result<(), BipError> {
        if !entry.mask_is_valid() {
            return Err(BipError::InvalidMask(entry.address));
        }
        if self.contains(entry.address) {
            return Err(BipError::DuplicateEntry(entry.address));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Replace the whole table, as Write-Broadcast-Distribution-Table
    /// does. Validation failures leave the table untouched.
    pub fn replace(&mut self, entries: Vec<BdtEntry>) -> Result<(), BipError> {
        for (index, entry) in entries.iter().enumerate() {
            if !entry.mask_is_valid() {
                return Err(BipError::InvalidMask(entry.address));
            }
            if entries[..index].iter().any(|e| e.address == entry.address) {
                return Err(BipError::DuplicateEntry(entry.address));
            }
        }
        self.entries = entries;
        Ok(())
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct FdtRecord {
    address: SocketAddrV4,
    ttl: u16,
    remaining: u32,
}

/// The foreign device table of a BBMD.
///
/// One record per registered device, in registration order. A record
/// lives for its TTL plus a grace period and is refreshed wholesale by
/// re-registration.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ForeignDeviceTable {
    records: Vec<FdtRecord>,
}

impl ForeignDeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, address: SocketAddrV4) -> bool {
        self.records.iter().any(|r| r.address == address)
    }

    /// Register or refresh a device; `remaining` restarts at TTL plus
    /// grace.
    pub fn register(&mut self, address: SocketAddrV4, ttl: u16) {
        let remaining = u32::from(ttl) + REGISTRATION_GRACE_SECS;
        match self.records.iter_mut().find(|r| r.address == address) {
            Some(record) => {
                record.ttl = ttl;
                record.remaining = remaining;
            }
            None => self.records.push(FdtRecord {
                address,
                ttl,
                remaining,
            }),
        }
    }

    pub fn delete(&mut self, address: SocketAddrV4) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.address != address);
        self.records.len() != before
    }

    /// Age every record by `seconds`, dropping the expired ones.
    pub fn tick(&mut self, seconds: u32) {
        for record in &mut self.records {
            record.remaining = record.remaining.saturating_sub(seconds);
        }
        self.records.retain(|r| r.remaining > 0);
    }

    /// Registered device addresses, in table order.
    pub fn addresses(&self) -> Vec<SocketAddrV4> {
        self.records.iter().map(|r| r.address).collect()
    }

    /// Seconds left for one device, if registered.
    pub fn remaining(&self, address: SocketAddrV4) -> Option<u32> {
        self.records
            .iter()
            .find(|r| r.address == address)
            .map(|r| r.remaining)
    }

    /// Wire snapshot for a Read-Foreign-Device-Table Ack.
    pub fn entries(&self) -> Vec<FdtEntry> {
        self.records
            .iter()
            .map(|r| FdtEntry {
                address: r.address,
                ttl: r.ttl,
                remaining: r.remaining.min(u32::from(u16::MAX)) as u16,
            })
            .collect()
    }
}

/// The NAK a non-BBMD node answers a management request with.
pub(crate) fn nak_for(function: BvllFunction) -> Option<ResultCode> {
    match function {
        BvllFunction::WriteBroadcastDistributionTable => Some(ResultCode::WriteBdtNak),
        BvllFunction::ReadBroadcastDistributionTable => Some(ResultCode::ReadBdtNak),
        BvllFunction::RegisterForeignDevice => Some(ResultCode::RegisterForeignDeviceNak),
        BvllFunction::ReadForeignDeviceTable => Some(ResultCode::ReadFdtNak),
        BvllFunction::DeleteForeignDeviceTableEntry => Some(ResultCode::DeleteFdtEntryNak),
        BvllFunction::DistributeBroadcastToNetwork => Some(ResultCode::DistributeBroadcastNak),
        _ => None,
    }
}

/// The (ip, port) of the station a PDU came from.
pub(crate) fn source_tuple(pdu: &Pdu) -> Result<SocketAddrV4, StackError> {
    match pdu.source.address() {
        Some(addr) => addr.addr_tuple().map_err(StackError::from),
        None => Err(StackError::InvalidSource {
            layer: "bip",
            endpoint: pdu.source.clone(),
        }),
    }
}
