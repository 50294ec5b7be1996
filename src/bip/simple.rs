//! Simple BACnet/IP Node
//!
//! The plain, non-BBMD, non-foreign role. Downward it wraps NPDUs in
//! original unicast/broadcast frames; upward it unwraps them. It owns no
//! tables, so every BBMD-management request is answered with exactly one
//! Result carrying the matching NAK code.

use log::{debug, warn};

use crate::address::Address;
use crate::bip::nak_for;
use crate::bvll::BvllFrame;
use crate::comm::{Effects, Layer, Result, StackError};
use crate::pdu::{Payload, Pdu};

/// Ordinary BACnet/IP node semantics.
#[derive(Debug, Default)]
pub struct BipSimple;

impl BipSimple {
    pub fn new() -> Self {
        Self
    }
}

impl Layer for BipSimple {
    fn name(&self) -> &'static str {
        "bip-simple"
    }

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        let Payload::Raw(npdu) = &pdu.payload else {
            return Err(StackError::UnexpectedPayload(self.name()));
        };
        match pdu.destination.address() {
            Some(dest @ Address::LocalStation(_)) => {
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::OriginalUnicastNpdu(npdu.clone()),
                    pdu.source.clone(),
                    dest.clone(),
                ));
            }
            Some(Address::LocalBroadcast) => {
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::OriginalBroadcastNpdu(npdu.clone()),
                    pdu.source.clone(),
                    Address::LocalBroadcast,
                ));
            }
            // remote and global scopes go out as a local broadcast; the
            // routing happens at the network layer above
            Some(Address::RemoteBroadcast(_))
            | Some(Address::RemoteStation(_, _))
            | Some(Address::GlobalBroadcast) => {
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::OriginalBroadcastNpdu(npdu.clone()),
                    pdu.source.clone(),
                    Address::LocalBroadcast,
                ));
            }
            _ => {
                return Err(StackError::InvalidDestination {
                    layer: self.name(),
                    destination: pdu.destination.clone(),
                });
            }
        }
        Ok(())
    }

    fn confirmation(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        let Payload::Bvll(frame) = pdu.payload.clone() else {
            return Err(StackError::UnexpectedPayload(self.name()));
        };
        match frame {
            BvllFrame::OriginalUnicastNpdu(npdu) => {
                fx.response(Pdu::derived_from(
                    &pdu,
                    npdu,
                    pdu.source.clone(),
                    pdu.destination.clone(),
                ));
            }
            BvllFrame::OriginalBroadcastNpdu(npdu) => {
                fx.response(Pdu::derived_from(
                    &pdu,
                    npdu,
                    pdu.source.clone(),
                    Address::LocalBroadcast,
                ));
            }
            BvllFrame::ForwardedNpdu { origin, npdu } => {
                fx.response(Pdu::derived_from(
                    &pdu,
                    npdu,
                    Address::local_station(origin),
                    Address::LocalBroadcast,
                ));
            }
            BvllFrame::Result(_)
            | BvllFrame::ReadBroadcastDistributionTableAck(_)
            | BvllFrame::ReadForeignDeviceTableAck(_) => {
                // results and acks belong to whoever asked above us
                fx.response(pdu.clone());
            }
            other => match nak_for(other.function()) {
                Some(code) => {
                    warn!(
                        "{}: {} from {} on a non-BBMD node, answering {}",
                        self.name(),
                        other.function(),
                        pdu.source,
                        code
                    );
                    fx.request(Pdu::derived_from(
                        &pdu,
                        BvllFrame::Result(code),
                        pdu.destination.clone(),
                        pdu.source.clone(),
                    ));
                }
                None => {
                    debug!("{}: dropping {} from {}", self.name(), other.function(), pdu.source);
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::bvll::ResultCode;
    use crate::clock::TimeMachine;
    use crate::comm::TimerBinding;
    use crate::pdu::Endpoint;

    fn down(pdu: Pdu) -> Vec<Pdu> {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut fx = Effects::new(&mut clock, 0, 0);
        BipSimple::new().indication(pdu, &mut fx).unwrap();
        fx.into_emissions().0
    }

    fn up(pdu: Pdu) -> (Vec<Pdu>, Vec<Pdu>) {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut fx = Effects::new(&mut clock, 0, 0);
        BipSimple::new().confirmation(pdu, &mut fx).unwrap();
        fx.into_emissions()
    }

    fn npdu() -> Bytes {
        Bytes::from_static(b"\x01\x00")
    }

    fn peer() -> Address {
        Address::local_station("192.168.1.9:47808".parse().unwrap())
    }

    #[test]
    fn test_downward_mapping() {
        let out = down(Pdu::new(npdu()).with_destination(peer()));
        assert_eq!(
            out[0].payload,
            Payload::Bvll(BvllFrame::OriginalUnicastNpdu(npdu()))
        );
        assert_eq!(out[0].destination, Endpoint::Address(peer()));

        for destination in [
            Address::LocalBroadcast,
            Address::RemoteBroadcast(7),
            Address::GlobalBroadcast,
        ] {
            let out = down(Pdu::new(npdu()).with_destination(destination));
            assert_eq!(
                out[0].payload,
                Payload::Bvll(BvllFrame::OriginalBroadcastNpdu(npdu()))
            );
            assert_eq!(out[0].destination, Endpoint::Address(Address::LocalBroadcast));
        }
    }

    #[test]
    fn test_upward_npdus() {
        let me = Address::local_station("192.168.1.2:47808".parse().unwrap());

        let (_, ups) = up(Pdu::new(BvllFrame::OriginalUnicastNpdu(npdu()))
            .with_source(peer())
            .with_destination(me.clone()));
        assert_eq!(ups[0].payload, Payload::Raw(npdu()));
        assert_eq!(ups[0].source, Endpoint::Address(peer()));
        assert_eq!(ups[0].destination, Endpoint::Address(me));

        let origin: std::net::SocketAddrV4 = "192.168.7.4:47808".parse().unwrap();
        let (_, ups) = up(Pdu::new(BvllFrame::ForwardedNpdu {
            origin,
            npdu: npdu(),
        })
        .with_source(peer()));
        assert_eq!(ups[0].source, Endpoint::Address(Address::local_station(origin)));
        assert_eq!(ups[0].destination, Endpoint::Address(Address::LocalBroadcast));
    }

    #[test]
    fn test_management_requests_get_naks() {
        let cases = [
            (
                BvllFrame::ReadBroadcastDistributionTable,
                ResultCode::ReadBdtNak,
            ),
            (
                BvllFrame::WriteBroadcastDistributionTable(Vec::new()),
                ResultCode::WriteBdtNak,
            ),
            (
                BvllFrame::RegisterForeignDevice { ttl: 10 },
                ResultCode::RegisterForeignDeviceNak,
            ),
            (BvllFrame::ReadForeignDeviceTable, ResultCode::ReadFdtNak),
            (
                BvllFrame::DeleteForeignDeviceTableEntry {
                    address: "192.168.1.9:47808".parse().unwrap(),
                },
                ResultCode::DeleteFdtEntryNak,
            ),
            (
                BvllFrame::DistributeBroadcastToNetwork(npdu()),
                ResultCode::DistributeBroadcastNak,
            ),
        ];
        for (frame, code) in cases {
            let (downs, ups) = up(Pdu::new(frame).with_source(peer()));
            assert!(ups.is_empty());
            assert_eq!(downs.len(), 1);
            assert_eq!(downs[0].payload, Payload::Bvll(BvllFrame::Result(code)));
            assert_eq!(downs[0].destination, Endpoint::Address(peer()));
        }
    }

    #[test]
    fn test_results_propagate_up() {
        let (downs, ups) = up(Pdu::new(BvllFrame::Result(ResultCode::Success)).with_source(peer()));
        assert!(downs.is_empty());
        assert_eq!(
            ups[0].payload,
            Payload::Bvll(BvllFrame::Result(ResultCode::Success))
        );
    }
}
