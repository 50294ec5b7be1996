//! BACnet Broadcast Management Device
//!
//! A BBMD re-originates broadcasts across IP subnets. Local broadcasts go
//! out three ways: as an original broadcast on the local wire, as
//! Forwarded-NPDUs to every BDT peer (at the peer's distribution address,
//! so an all-ones mask degenerates to a unicast and anything shorter to a
//! directed broadcast), and as Forwarded-NPDUs to every registered
//! foreign device.
//!
//! Inbound, the BBMD answers the table-management requests, completes the
//! second hop for Forwarded-NPDUs that arrived as unicasts, and treats a
//! Distribute-Broadcast-To-Network from a registered foreign device as if
//! that device had broadcast on the local subnet. A Forwarded-NPDU is
//! never forwarded back to BDT peers, which is what keeps peerings
//! loop-free.

use std::net::SocketAddrV4;

use log::{debug, warn};

use crate::address::Address;
use crate::bip::{
    source_tuple, BipError, BroadcastDistributionTable, ForeignDeviceTable, FDT_TICK,
};
use crate::bvll::{BdtEntry, BvllFrame, ResultCode};
use crate::clock::TaskHandle;
use crate::comm::{Effects, Layer, Result, StackError, TimerToken};
use crate::pdu::{Payload, Pdu};

const TOKEN_FDT_TICK: TimerToken = TimerToken(1);

/// BBMD role: table maintenance and broadcast redistribution.
#[derive(Debug)]
pub struct BipBbmd {
    address: SocketAddrV4,
    bdt: BroadcastDistributionTable,
    fdt: ForeignDeviceTable,
    tick: Option<TaskHandle>,
}

impl BipBbmd {
    /// A BBMD at `address`; the BDT starts with the BBMD itself as its
    /// first, all-ones entry.
    pub fn new(address: SocketAddrV4) -> Self {
        Self {
            address,
            bdt: BroadcastDistributionTable::new(address),
            fdt: ForeignDeviceTable::new(),
            tick: None,
        }
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn add_peer(&mut self, entry: BdtEntry) -> std::result::Result<(), BipError> {
        self.bdt.add_peer(entry)
    }

    pub fn bdt(&self) -> &BroadcastDistributionTable {
        &self.bdt
    }

    pub fn fdt(&self) -> &ForeignDeviceTable {
        &self.fdt
    }

    fn reply(&self, pdu: &Pdu, code: ResultCode, fx: &mut Effects<'_>) {
        fx.request(Pdu::derived_from(
            pdu,
            BvllFrame::Result(code),
            Address::Null,
            pdu.source.clone(),
        ));
    }

    fn forward_to_peers(&self, pdu: &Pdu, frame: &BvllFrame, fx: &mut Effects<'_>) {
        for peer in self.bdt.peers() {
            fx.request(Pdu::derived_from(
                pdu,
                frame.clone(),
                Address::Null,
                Address::local_station(peer.forward_address()),
            ));
        }
    }

    fn forward_to_foreign(
        &self,
        pdu: &Pdu,
        frame: &BvllFrame,
        exclude: Option<SocketAddrV4>,
        fx: &mut Effects<'_>,
    ) {
        for device in self.fdt.addresses() {
            if Some(device) == exclude {
                continue;
            }
            fx.request(Pdu::derived_from(
                pdu,
                frame.clone(),
                Address::Null,
                Address::local_station(device),
            ));
        }
    }
}

impl Layer for BipBbmd {
    fn name(&self) -> &'static str {
        "bip-bbmd"
    }

    fn start(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        self.tick = Some(fx.call_later(FDT_TICK, TOKEN_FDT_TICK));
        Ok(())
    }

    fn stop(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        if let Some(handle) = self.tick.take() {
            fx.cancel(handle);
        }
        Ok(())
    }

    fn timer(&mut self, token: TimerToken, fx: &mut Effects<'_>) -> Result<()> {
        if token == TOKEN_FDT_TICK {
            self.fdt.tick(FDT_TICK.as_secs() as u32);
            self.tick = Some(fx.call_later(FDT_TICK, TOKEN_FDT_TICK));
        }
        Ok(())
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
                let forward = BvllFrame::ForwardedNpdu {
                    origin: self.address,
                    npdu: npdu.clone(),
                };
                self.forward_to_peers(&pdu, &forward, fx);
                self.forward_to_foreign(&pdu, &forward, None, fx);
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
                    npdu.clone(),
                    pdu.source.clone(),
                    Address::LocalBroadcast,
                ));
                // peers hear the subnet they are responsible for
                // themselves; only registered foreign devices are fed
                let origin = source_tuple(&pdu)?;
                let forward = BvllFrame::ForwardedNpdu { origin, npdu };
                self.forward_to_foreign(&pdu, &forward, None, fx);
            }
            BvllFrame::ForwardedNpdu { origin, npdu } => {
                let sender = source_tuple(&pdu)?;
                if !self.bdt.contains(sender) {
                    warn!(
                        "{}: ForwardedNPDU from unknown peer {}, dropped",
                        self.name(),
                        sender
                    );
                    return Ok(());
                }
                fx.response(Pdu::derived_from(
                    &pdu,
                    npdu.clone(),
                    Address::local_station(origin),
                    Address::LocalBroadcast,
                ));
                let forward = BvllFrame::ForwardedNpdu { origin, npdu };
                // a unicast arrival means the peer holds us with an
                // all-ones mask; the second hop onto our subnet is ours
                if matches!(pdu.destination.address(), Some(Address::LocalStation(_))) {
                    fx.request(Pdu::derived_from(
                        &pdu,
                        forward.clone(),
                        Address::Null,
                        Address::LocalBroadcast,
                    ));
                }
                self.forward_to_foreign(&pdu, &forward, None, fx);
            }
            BvllFrame::DistributeBroadcastToNetwork(npdu) => {
                let sender = source_tuple(&pdu)?;
                if !self.fdt.contains(sender) {
                    debug!(
                        "{}: distribute from unregistered {}, NAK",
                        self.name(),
                        sender
                    );
                    self.reply(&pdu, ResultCode::DistributeBroadcastNak, fx);
                    return Ok(());
                }
                fx.response(Pdu::derived_from(
                    &pdu,
                    npdu.clone(),
                    pdu.source.clone(),
                    Address::LocalBroadcast,
                ));
                let forward = BvllFrame::ForwardedNpdu {
                    origin: sender,
                    npdu,
                };
                // the local subnet hears it as if the device were here
                fx.request(Pdu::derived_from(
                    &pdu,
                    forward.clone(),
                    Address::Null,
                    Address::LocalBroadcast,
                ));
                self.forward_to_peers(&pdu, &forward, fx);
                self.forward_to_foreign(&pdu, &forward, Some(sender), fx);
            }
            BvllFrame::RegisterForeignDevice { ttl } => {
                let sender = source_tuple(&pdu)?;
                if ttl == 0 {
                    debug!("{}: unregistering {}", self.name(), sender);
                    self.fdt.delete(sender);
                } else {
                    debug!("{}: registering {} for {}s", self.name(), sender, ttl);
                    self.fdt.register(sender, ttl);
                }
                self.reply(&pdu, ResultCode::Success, fx);
            }
            BvllFrame::DeleteForeignDeviceTableEntry { address } => {
                let code = if self.fdt.delete(address) {
                    ResultCode::Success
                } else {
                    ResultCode::DeleteFdtEntryNak
                };
                self.reply(&pdu, code, fx);
            }
            BvllFrame::ReadBroadcastDistributionTable => {
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::ReadBroadcastDistributionTableAck(self.bdt.entries().to_vec()),
                    Address::Null,
                    pdu.source.clone(),
                ));
            }
            BvllFrame::WriteBroadcastDistributionTable(entries) => {
                match self.bdt.replace(entries) {
                    Ok(()) => self.reply(&pdu, ResultCode::Success, fx),
                    Err(err) => {
                        warn!("{}: rejecting BDT write: {}", self.name(), err);
                        self.reply(&pdu, ResultCode::WriteBdtNak, fx);
                    }
                }
            }
            BvllFrame::ReadForeignDeviceTable => {
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::ReadForeignDeviceTableAck(self.fdt.entries()),
                    Address::Null,
                    pdu.source.clone(),
                ));
            }
            BvllFrame::Result(_)
            | BvllFrame::ReadBroadcastDistributionTableAck(_)
            | BvllFrame::ReadForeignDeviceTableAck(_) => {
                fx.response(pdu.clone());
            }
        }
        Ok(())
    }
}
