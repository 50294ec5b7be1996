//! BACnet Address Model
//!
//! This module implements the typed address taxonomy used to route and
//! filter PDUs throughout the stack. An address is one of six variants:
//! local or remote stations, local/remote/global broadcasts, and the null
//! address. For BACnet/IP a station MAC is six octets (four IPv4 octets
//! followed by the big-endian UDP port), and a local station may carry a
//! subnet prefix from which its broadcast tuple is derived.
//!
//! # Textual forms
//!
//! Addresses parse from the notations used in configuration surfaces:
//!
//! - `"192.168.1.2/24:47808"`: IP station with prefix and port
//! - `"192.168.1.2"`: IP station, default port, no prefix
//! - `"*"`: local broadcast, `"*:*"`: global broadcast
//! - `"7:*"`: broadcast on remote network 7
//! - `"7:18"` / `"7:0x1a2b"`: station on remote network 7
//! - `"18"`: one-octet local station (non-IP datalinks)
//!
//! # Matching
//!
//! [`matches`] answers "does address `a` satisfy filter `b`" per the
//! variant of the filter. Some variants are not usable as filters; those
//! combinations surface [`AddressError::Unmatchable`] rather than silently
//! failing, and the call sites decide how to treat them.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use thiserror::Error;

use crate::BACNET_IP_PORT;

/// Result type for address operations
pub type Result<T> = std::result::Result<T, AddressError>;

/// Errors that can occur when constructing, parsing or matching addresses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// A MAC must be 1..=6 octets.
    #[error("invalid MAC length {0}, expected 1..=6 octets")]
    InvalidMacLength(usize),
    /// Remote network numbers are 1..=65534; 65535 is the global broadcast.
    #[error("network number {0} out of range 1..=65534")]
    InvalidNetwork(u16),
    /// IPv4 prefixes are 0..=32.
    #[error("invalid prefix length {0}")]
    InvalidPrefix(u8),
    /// The operation needs a six-octet IP station MAC.
    #[error("not an IP station address")]
    NotIpStation,
    /// The filter variant cannot be used in a match.
    #[error("unmatchable filter {0}")]
    Unmatchable(Address),
    /// The textual form is not one of the accepted notations.
    #[error("cannot parse address {0:?}")]
    Parse(String),
}

/// A datalink MAC address, 1..=6 octets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mac(Vec<u8>);

impl Mac {
    pub fn new(octets: impl Into<Vec<u8>>) -> Result<Self> {
        let octets = octets.into();
        if octets.is_empty() || octets.len() > 6 {
            return Err(AddressError::InvalidMacLength(octets.len()));
        }
        Ok(Self(octets))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            write!(f, "{}", self.0[0])
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

/// A local station: MAC plus an optional subnet prefix.
///
/// The prefix only participates in broadcast-tuple derivation; it is
/// excluded from equality and hashing so that a station configured as
/// `192.168.1.2/24` still compares equal to the same station seen on the
/// wire without a prefix.
#[derive(Debug, Clone, Eq)]
pub struct Station {
    mac: Mac,
    prefix: Option<u8>,
}

impl PartialEq for Station {
    fn eq(&self, other: &Self) -> bool {
        self.mac == other.mac
    }
}

impl std::hash::Hash for Station {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.mac.hash(state);
    }
}

impl Station {
    pub fn new(mac: Mac) -> Self {
        Self { mac, prefix: None }
    }

    pub fn from_socket_addr(addr: SocketAddrV4) -> Self {
        Self {
            mac: Mac(pack_ip_addr(addr).to_vec()),
            prefix: None,
        }
    }

    pub fn with_prefix(addr: SocketAddrV4, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(AddressError::InvalidPrefix(prefix));
        }
        Ok(Self {
            mac: Mac(pack_ip_addr(addr).to_vec()),
            prefix: Some(prefix),
        })
    }

    pub fn mac(&self) -> &Mac {
        &self.mac
    }

    pub fn prefix(&self) -> Option<u8> {
        self.prefix
    }

    /// The unicast (ip, port) tuple of an IP station.
    pub fn addr_tuple(&self) -> Result<SocketAddrV4> {
        unpack_ip_addr(self.mac.as_slice())
    }

    /// The subnet-broadcast (ip, port) tuple of an IP station.
    ///
    /// Without a prefix the mask is all ones and the broadcast tuple
    /// degenerates to the unicast tuple.
    pub fn broadcast_tuple(&self) -> Result<SocketAddrV4> {
        let unicast = self.addr_tuple()?;
        let mask = prefix_mask(self.prefix.unwrap_or(32));
        let ip = u32::from(*unicast.ip()) | !mask;
        Ok(SocketAddrV4::new(Ipv4Addr::from(ip), unicast.port()))
    }
}

/// A BACnet address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// No address.
    Null,
    /// All stations on the local network.
    LocalBroadcast,
    /// A station on the local network.
    LocalStation(Station),
    /// All stations on a remote network.
    RemoteBroadcast(u16),
    /// A station on a remote network.
    RemoteStation(u16, Mac),
    /// All stations on all networks.
    GlobalBroadcast,
}

impl Address {
    /// An IP local station from an (ip, port) tuple.
    pub fn local_station(addr: SocketAddrV4) -> Self {
        Address::LocalStation(Station::from_socket_addr(addr))
    }

    /// An IP local station carrying a subnet prefix.
    pub fn with_prefix(addr: SocketAddrV4, prefix: u8) -> Result<Self> {
        Ok(Address::LocalStation(Station::with_prefix(addr, prefix)?))
    }

    pub fn remote_broadcast(net: u16) -> Result<Self> {
        check_network(net)?;
        Ok(Address::RemoteBroadcast(net))
    }

    pub fn remote_station(net: u16, mac: Mac) -> Result<Self> {
        check_network(net)?;
        Ok(Address::RemoteStation(net, mac))
    }

    /// The unicast (ip, port) tuple; only IP local stations have one.
    pub fn addr_tuple(&self) -> Result<SocketAddrV4> {
        match self {
            Address::LocalStation(station) => station.addr_tuple(),
            _ => Err(AddressError::NotIpStation),
        }
    }

    /// The subnet-broadcast (ip, port) tuple of an IP local station.
    pub fn broadcast_tuple(&self) -> Result<SocketAddrV4> {
        match self {
            Address::LocalStation(station) => station.broadcast_tuple(),
            _ => Err(AddressError::NotIpStation),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Address::LocalBroadcast | Address::RemoteBroadcast(_) | Address::GlobalBroadcast
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Null => write!(f, "null"),
            Address::LocalBroadcast => write!(f, "*"),
            Address::GlobalBroadcast => write!(f, "*:*"),
            Address::RemoteBroadcast(net) => write!(f, "{}:*", net),
            Address::RemoteStation(net, mac) => write!(f, "{}:{}", net, mac),
            Address::LocalStation(station) => match station.addr_tuple() {
                Ok(tuple) => {
                    if let Some(prefix) = station.prefix().filter(|p| *p < 32) {
                        write!(f, "{}/{}:{}", tuple.ip(), prefix, tuple.port())
                    } else {
                        write!(f, "{}:{}", tuple.ip(), tuple.port())
                    }
                }
                Err(_) => write!(f, "{}", station.mac()),
            },
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "" => return Err(AddressError::Parse(s.into())),
            "*" => return Ok(Address::LocalBroadcast),
            "*:*" => return Ok(Address::GlobalBroadcast),
            _ => {}
        }

        if s.contains('.') {
            return parse_ip_station(s);
        }

        if let Some((net, rest)) = s.split_once(':') {
            let net: u16 = net
                .parse()
                .map_err(|_| AddressError::Parse(s.into()))?;
            check_network(net)?;
            if rest == "*" {
                return Ok(Address::RemoteBroadcast(net));
            }
            return Ok(Address::RemoteStation(net, parse_mac(rest)?));
        }

        Ok(Address::LocalStation(Station::new(parse_mac(s)?)))
    }
}

fn parse_ip_station(s: &str) -> Result<Address> {
    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| AddressError::Parse(s.into()))?,
        ),
        None => (s, BACNET_IP_PORT),
    };

    let (ip, prefix) = match host.split_once('/') {
        Some((ip, prefix)) => (
            ip,
            Some(
                prefix
                    .parse::<u8>()
                    .map_err(|_| AddressError::Parse(s.into()))?,
            ),
        ),
        None => (host, None),
    };

    let ip: Ipv4Addr = ip.parse().map_err(|_| AddressError::Parse(s.into()))?;
    let tuple = SocketAddrV4::new(ip, port);
    match prefix {
        Some(prefix) => Address::with_prefix(tuple, prefix),
        None => Ok(Address::local_station(tuple)),
    }
}

fn parse_mac(s: &str) -> Result<Mac> {
    if let Ok(octet) = s.parse::<u8>() {
        return Mac::new(vec![octet]);
    }
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let octets = hex::decode(digits).map_err(|_| AddressError::Parse(s.into()))?;
    Mac::new(octets)
}

fn check_network(net: u16) -> Result<()> {
    if net == 0 || net == 65535 {
        return Err(AddressError::InvalidNetwork(net));
    }
    Ok(())
}

/// The IPv4 netmask of a prefix length.
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

/// Pack an (ip, port) tuple into the six-octet B/IP MAC form.
pub fn pack_ip_addr(addr: SocketAddrV4) -> [u8; 6] {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

/// Unpack a six-octet B/IP MAC into an (ip, port) tuple.
pub fn unpack_ip_addr(octets: &[u8]) -> Result<SocketAddrV4> {
    if octets.len() != 6 {
        return Err(AddressError::NotIpStation);
    }
    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
    let port = u16::from_be_bytes([octets[4], octets[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Does address `addr` satisfy filter `filter`?
///
/// The truth table is keyed on the filter's variant; variants that make no
/// sense as a filter are an error, never a silent non-match.
pub fn matches(addr: &Address, filter: &Address) -> Result<bool> {
    match filter {
        Address::LocalBroadcast => Ok(matches!(
            addr,
            Address::LocalStation(_) | Address::LocalBroadcast
        )),
        Address::LocalStation(filter_station) => Ok(match addr {
            Address::LocalStation(station) => station == filter_station,
            _ => false,
        }),
        Address::RemoteBroadcast(filter_net) => Ok(match addr {
            Address::RemoteStation(net, _) | Address::RemoteBroadcast(net) => net == filter_net,
            _ => false,
        }),
        Address::RemoteStation(filter_net, filter_mac) => Ok(match addr {
            Address::RemoteStation(net, mac) => net == filter_net && mac == filter_mac,
            _ => false,
        }),
        Address::GlobalBroadcast => Ok(matches!(addr, Address::GlobalBroadcast)),
        Address::Null => Err(AddressError::Unmatchable(filter.clone())),
    }
}
