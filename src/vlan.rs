//! Virtual IP Substrate
//!
//! An in-process stand-in for UDP: [`VirtualIpNetwork`] owns a set of
//! [`VirtualIpNode`]s keyed by (ip, port) and delivers datagrams by the
//! same rules a subnet would: unicast to exactly one owner, subnet
//! broadcast to everyone except the origin, nothing across subnets.
//! [`VirtualIpRouter`] bridges networks for unicasts and directed
//! broadcasts; plain subnet broadcasts never cross it, which is exactly
//! the gap the BBMD machinery exists to fill.
//!
//! Nodes can opt into promiscuous reception (see every datagram on the
//! wire) and source spoofing (emit datagrams with a foreign source);
//! both default to off. Every datagram accepted onto the wire is appended
//! to a per-network traffic log for test introspection.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use log::{trace, warn};
use thiserror::Error;

use crate::address::prefix_mask;

/// Index of a network within its owning runtime.
pub type NetworkId = usize;

/// Index of a node within its network.
pub type NodeId = usize;

/// Result type for substrate operations
pub type Result<T> = std::result::Result<T, VlanError>;

/// Errors that can occur on the virtual wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VlanError {
    /// Two nodes may not share an (ip, port) tuple.
    #[error("node address {0} already in use")]
    AddressInUse(SocketAddrV4),
    /// The node is not on this network's subnet.
    #[error("address {0} is not on subnet {1}")]
    NotOnSubnet(SocketAddrV4, Ipv4Addr),
    /// A non-spoofing node tried to emit a foreign source address.
    #[error("node {0} may not send with source {1}")]
    SpoofDenied(SocketAddrV4, SocketAddrV4),
    /// No such node.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

/// A raw datagram on the virtual wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: Bytes,
}

/// A wire observation: the datagram and when it was sent.
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    pub at: Duration,
    pub datagram: Datagram,
}

/// Where a datagram handed to [`VirtualIpNetwork::send`] ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered (or dropped) on this subnet.
    Local,
    /// The destination is off-subnet; a router may pick it up.
    NotLocal,
}

/// A single endpoint on a virtual network.
#[derive(Debug)]
pub struct VirtualIpNode {
    address: SocketAddrV4,
    promiscuous: bool,
    spoofing: bool,
    inbound: VecDeque<Datagram>,
}

impl VirtualIpNode {
    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn promiscuous(&self) -> bool {
        self.promiscuous
    }

    pub fn spoofing(&self) -> bool {
        self.spoofing
    }
}

/// A virtual subnet owning its nodes and a traffic log.
pub struct VirtualIpNetwork {
    name: String,
    subnet: Ipv4Addr,
    prefix: u8,
    nodes: Vec<VirtualIpNode>,
    traffic: Vec<TrafficRecord>,
}

impl VirtualIpNetwork {
    pub fn new(name: &str, subnet: Ipv4Addr, prefix: u8) -> Self {
        let mask = prefix_mask(prefix);
        Self {
            name: name.to_string(),
            subnet: Ipv4Addr::from(u32::from(subnet) & mask),
            prefix,
            nodes: Vec::new(),
            traffic: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directed-broadcast address of this subnet.
    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet) | !prefix_mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & prefix_mask(self.prefix) == u32::from(self.subnet)
    }

    /// Add a node; its (ip, port) must be unique and on the subnet.
    pub fn add_node(
        &mut self,
        address: SocketAddrV4,
        promiscuous: bool,
        spoofing: bool,
    ) -> Result<NodeId> {
        if !self.contains(*address.ip()) {
            return Err(VlanError::NotOnSubnet(address, self.subnet));
        }
        if self.nodes.iter().any(|n| n.address == address) {
            return Err(VlanError::AddressInUse(address));
        }
        self.nodes.push(VirtualIpNode {
            address,
            promiscuous,
            spoofing,
            inbound: VecDeque::new(),
        });
        Ok(self.nodes.len() - 1)
    }

    pub fn node(&self, id: NodeId) -> Result<&VirtualIpNode> {
        self.nodes.get(id).ok_or(VlanError::UnknownNode(id))
    }

    /// Put a datagram on the wire.
    ///
    /// `origin` is the sending node for locally originated traffic and
    /// `None` for datagrams forwarded in by a router. The origin never
    /// receives its own broadcast.
    pub fn send(
        &mut self,
        origin: Option<NodeId>,
        datagram: Datagram,
        at: Duration,
    ) -> Result<Delivery> {
        if let Some(origin) = origin {
            let node = self.nodes.get(origin).ok_or(VlanError::UnknownNode(origin))?;
            if !node.spoofing && datagram.source != node.address {
                return Err(VlanError::SpoofDenied(node.address, datagram.source));
            }
        }

        trace!(
            "{}: {} -> {} [{}]",
            self.name,
            datagram.source,
            datagram.destination,
            hex::encode(&datagram.payload)
        );
        self.traffic.push(TrafficRecord {
            at,
            datagram: datagram.clone(),
        });

        let dest = datagram.destination;
        let is_broadcast = *dest.ip() == self.broadcast_address() || dest.ip().is_broadcast();

        if is_broadcast {
            for id in 0..self.nodes.len() {
                if Some(id) == origin {
                    continue;
                }
                let node = &mut self.nodes[id];
                if node.promiscuous || node.address.port() == dest.port() {
                    node.inbound.push_back(datagram.clone());
                }
            }
            return Ok(Delivery::Local);
        }

        let local = self.contains(*dest.ip());
        let mut delivered = false;
        for id in 0..self.nodes.len() {
            let node = &mut self.nodes[id];
            if local && node.address == dest {
                node.inbound.push_back(datagram.clone());
                delivered = true;
            } else if node.promiscuous && Some(id) != origin {
                node.inbound.push_back(datagram.clone());
            }
        }

        if local {
            if !delivered {
                warn!("{}: no node at {}, dropped", self.name, dest);
            }
            Ok(Delivery::Local)
        } else {
            Ok(Delivery::NotLocal)
        }
    }

    /// Drain everything queued for a node.
    pub fn drain_node(&mut self, id: NodeId) -> Vec<Datagram> {
        match self.nodes.get_mut(id) {
            Some(node) => node.inbound.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.nodes.iter().any(|n| !n.inbound.is_empty())
    }

    /// Every datagram seen on this network, in wire order.
    pub fn traffic(&self) -> &[TrafficRecord] {
        &self.traffic
    }

    pub fn clear_traffic(&mut self) {
        self.traffic.clear();
    }
}

struct RouterPort {
    network: NetworkId,
    gateway: SocketAddrV4,
    subnet: Ipv4Addr,
    prefix: u8,
}

/// Bridges virtual networks at their gateway addresses.
///
/// Unicasts and directed broadcasts whose destination falls in an attached
/// subnet are forwarded; limited broadcasts are not (BACnet solves that at
/// the application layer with BBMDs).
pub struct VirtualIpRouter {
    name: String,
    ports: Vec<RouterPort>,
}

impl VirtualIpRouter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ports: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a network at a gateway address with the given prefix.
    pub fn add_port(&mut self, network: NetworkId, gateway: SocketAddrV4, prefix: u8) {
        let subnet = Ipv4Addr::from(u32::from(*gateway.ip()) & prefix_mask(prefix));
        self.ports.push(RouterPort {
            network,
            gateway,
            subnet,
            prefix,
        });
    }

    /// The network a datagram from `from` should be forwarded onto, if any.
    pub fn route(&self, from: NetworkId, destination: SocketAddrV4) -> Option<NetworkId> {
        if destination.ip().is_broadcast() {
            return None;
        }
        // only traffic originating on an attached network is forwarded
        self.ports.iter().find(|p| p.network == from)?;
        self.ports
            .iter()
            .find(|p| {
                p.network != from
                    && u32::from(*destination.ip()) & prefix_mask(p.prefix) == u32::from(p.subnet)
            })
            .map(|p| p.network)
    }

    pub fn gateway(&self, network: NetworkId) -> Option<SocketAddrV4> {
        self.ports
            .iter()
            .find(|p| p.network == network)
            .map(|p| p.gateway)
    }
}
