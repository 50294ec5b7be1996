//! UDP Multiplexer
//!
//! The boundary between typed [`Address`](crate::address::Address)
//! endpoints and the raw (ip, port) tuples of the wire. Everything above
//! the multiplexer reasons in addresses; everything below it is a
//! datagram. Downward the source is always rewritten to the node's own
//! unicast tuple; upward the node's broadcast tuple is recognized and
//! reported as a local broadcast.

use std::net::SocketAddrV4;

use crate::address::{Address, Station};
use crate::comm::{Effects, Layer, Result, StackError};
use crate::pdu::{Payload, Pdu};

/// Address-to-tuple translation layer for one B/IP node.
#[derive(Debug)]
pub struct UdpMultiplexer {
    unicast: SocketAddrV4,
    broadcast: SocketAddrV4,
}

impl UdpMultiplexer {
    /// A multiplexer for a node at `address` on a subnet with the given
    /// prefix; the prefix determines the broadcast tuple.
    pub fn new(address: SocketAddrV4, prefix: u8) -> std::result::Result<Self, crate::address::AddressError> {
        let station = Station::with_prefix(address, prefix)?;
        Ok(Self {
            unicast: address,
            broadcast: station.broadcast_tuple()?,
        })
    }

    pub fn unicast_tuple(&self) -> SocketAddrV4 {
        self.unicast
    }

    pub fn broadcast_tuple(&self) -> SocketAddrV4 {
        self.broadcast
    }
}

impl Layer for UdpMultiplexer {
    fn name(&self) -> &'static str {
        "mux"
    }

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        let Payload::Raw(_) = pdu.payload else {
            return Err(StackError::UnexpectedPayload(self.name()));
        };
        let destination = match pdu.destination.address() {
            Some(Address::LocalBroadcast) => self.broadcast,
            Some(addr @ Address::LocalStation(_)) => addr.addr_tuple()?,
            _ => {
                // fatal for this PDU; nothing else is routable here
                return Err(StackError::InvalidDestination {
                    layer: self.name(),
                    destination: pdu.destination.clone(),
                });
            }
        };
        fx.request(Pdu::derived_from(
            &pdu,
            pdu.payload.clone(),
            self.unicast,
            destination,
        ));
        Ok(())
    }

    fn confirmation(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        let source = pdu.source.tuple().ok_or_else(|| StackError::InvalidSource {
            layer: self.name(),
            endpoint: pdu.source.clone(),
        })?;
        let destination = pdu
            .destination
            .tuple()
            .ok_or_else(|| StackError::InvalidDestination {
                layer: self.name(),
                destination: pdu.destination.clone(),
            })?;

        let destination = if destination == self.broadcast || destination.ip().is_broadcast() {
            Address::LocalBroadcast
        } else {
            Address::local_station(destination)
        };
        fx.response(Pdu::derived_from(
            &pdu,
            pdu.payload.clone(),
            Address::local_station(source),
            destination,
        ));
        Ok(())
    }
}
