//! State Machine Test Harness
//!
//! Scripted send/receive assertions over whole stacks. Each station gets a
//! [`ClientStateMachine`] holding an ordered script of steps:
//!
//! - `send` injects a PDU at the top of the station's stack;
//! - `call` does the same through an [`Iocb`], pairing the next matching
//!   upward PDU with the request;
//! - `expect` consumes the next upward PDU matching a [`PduExpect`]
//!   pattern.
//!
//! A [`StateMachineGroup`] drives all machines against one [`Runtime`],
//! interleaving wire settling with virtual-time advancement, and succeeds
//! only when every script ran to completion and nothing unexpected
//! arrived. A machine in sniffer mode keeps everything it sees for direct
//! inspection instead of failing on it.
//!
//! The module also provides the station builders the end-to-end tests are
//! made of: plain BVLL stations, promiscuous sniffers, and full
//! simple/foreign/BBMD stacks.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::Duration;

use thiserror::Error;

use crate::address::{Address, AddressError};
use crate::bip::{BipBbmd, BipError, BipForeign, BipSimple};
use crate::bvll::{AnnexJCodec, BdtEntry};
use crate::clock::TimeSource;
use crate::comm::{Layer, StackId, TimerBinding};
use crate::iocb::Iocb;
use crate::mux::UdpMultiplexer;
use crate::pdu::{Endpoint, Payload, Pdu};
use crate::runtime::{NodeConfig, Runtime};
use crate::vlan::{NetworkId, VlanError};

/// Errors raised while building stations or evaluating scripts
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("address: {0}")]
    Address(#[from] AddressError),
    #[error("vlan: {0}")]
    Vlan(#[from] VlanError),
    #[error("bip: {0}")]
    Bip(#[from] BipError),
    /// A machine finished the run with script steps left.
    #[error("machine {machine} still has {remaining} steps")]
    Incomplete { machine: String, remaining: usize },
    /// A strict machine received traffic its script did not expect.
    #[error("machine {machine} saw {count} unexpected PDUs")]
    UnexpectedTraffic { machine: String, count: usize },
}

/// Pattern for an expected PDU; absent fields match anything.
#[derive(Debug, Clone, Default)]
pub struct PduExpect {
    source: Option<Endpoint>,
    destination: Option<Endpoint>,
    payload: Option<Payload>,
}

impl PduExpect {
    /// Match any PDU at all.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match on the payload exactly.
    pub fn payload(payload: impl Into<Payload>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn from_source(mut self, source: impl Into<Endpoint>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn to_destination(mut self, destination: impl Into<Endpoint>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn matches(&self, pdu: &Pdu) -> bool {
        if let Some(source) = &self.source {
            if *source != pdu.source {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if *destination != pdu.destination {
                return false;
            }
        }
        if let Some(payload) = &self.payload {
            if *payload != pdu.payload {
                return false;
            }
        }
        true
    }
}

enum Step {
    Send(Pdu),
    Call {
        iocb: usize,
        expect: PduExpect,
        sent: bool,
    },
    Expect(PduExpect),
}

/// A scripted station: send/receive assertions over one stack.
pub struct ClientStateMachine {
    name: String,
    stack: StackId,
    steps: VecDeque<Step>,
    iocbs: Vec<Iocb>,
    received: Vec<Pdu>,
    sniffer: bool,
}

impl ClientStateMachine {
    pub fn new(name: &str, stack: StackId) -> Self {
        Self {
            name: name.to_string(),
            stack,
            steps: VecDeque::new(),
            iocbs: Vec::new(),
            received: Vec::new(),
            sniffer: false,
        }
    }

    /// A machine that records everything and never fails on unmatched
    /// traffic.
    pub fn sniffer(name: &str, stack: StackId) -> Self {
        let mut machine = Self::new(name, stack);
        machine.sniffer = true;
        machine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&mut self, pdu: Pdu) -> &mut Self {
        self.steps.push_back(Step::Send(pdu));
        self
    }

    /// Send a request through an IOCB and pair the next matching upward
    /// PDU with it. Returns the IOCB index for inspection after the run.
    pub fn call(&mut self, request: Pdu, expect: PduExpect) -> usize {
        let index = self.iocbs.len();
        self.iocbs.push(Iocb::new(request));
        self.steps.push_back(Step::Call {
            iocb: index,
            expect,
            sent: false,
        });
        index
    }

    pub fn expect(&mut self, expect: PduExpect) -> &mut Self {
        self.steps.push_back(Step::Expect(expect));
        self
    }

    pub fn iocb(&self, index: usize) -> &Iocb {
        &self.iocbs[index]
    }

    /// Traffic that matched no script step (everything, for a sniffer).
    pub fn received(&self) -> &[Pdu] {
        &self.received
    }

    pub fn is_done(&self) -> bool {
        self.steps.is_empty()
    }

    fn next_send(&mut self) -> Option<Pdu> {
        match self.steps.front_mut() {
            Some(Step::Send(_)) => {
                let Some(Step::Send(pdu)) = self.steps.pop_front() else {
                    unreachable!()
                };
                Some(pdu)
            }
            Some(Step::Call { iocb, sent, .. }) if !*sent => {
                *sent = true;
                Some(self.iocbs[*iocb].request().clone())
            }
            _ => None,
        }
    }

    fn offer(&mut self, pdu: Pdu) {
        let matched = match self.steps.front() {
            Some(Step::Expect(expect)) => expect.matches(&pdu),
            Some(Step::Call { expect, sent, .. }) => *sent && expect.matches(&pdu),
            _ => false,
        };
        if !matched {
            self.received.push(pdu);
            return;
        }
        match self.steps.pop_front() {
            Some(Step::Call { iocb, .. }) => self.iocbs[iocb].complete(pdu),
            Some(Step::Expect(_)) => {}
            _ => unreachable!("matched step is present"),
        }
    }
}

/// Drives a set of machines against one runtime.
#[derive(Default)]
pub struct StateMachineGroup {
    machines: Vec<ClientStateMachine>,
}

impl StateMachineGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, machine: ClientStateMachine) -> usize {
        self.machines.push(machine);
        self.machines.len() - 1
    }

    pub fn machine(&self, index: usize) -> &ClientStateMachine {
        &self.machines[index]
    }

    /// Run every script for at most `time_limit` of virtual time.
    ///
    /// Succeeds when each machine consumed its whole script and no strict
    /// machine saw unexpected traffic. The runtime's clock ends at the
    /// deadline.
    pub fn run<C: TimeSource<TimerBinding>>(
        &mut self,
        rt: &mut Runtime<C>,
        time_limit: Duration,
    ) -> Result<(), HarnessError> {
        let deadline = rt.now() + time_limit;
        rt.settle();
        loop {
            // exchange with the stacks until no script makes progress
            loop {
                let mut progress = false;
                for machine in &mut self.machines {
                    for pdu in rt.take_upward(machine.stack) {
                        machine.offer(pdu);
                        progress = true;
                    }
                    while let Some(pdu) = machine.next_send() {
                        rt.send(machine.stack, pdu);
                        progress = true;
                    }
                }
                if !progress {
                    break;
                }
            }
            // play the clock out to the deadline even when every script
            // already completed, so late duplicates still get caught
            if !rt.fire_next_timer(deadline) {
                break;
            }
        }
        rt.advance_to(deadline);
        rt.settle();
        for machine in &mut self.machines {
            for pdu in rt.take_upward(machine.stack) {
                machine.offer(pdu);
            }
        }

        for machine in &self.machines {
            if !machine.is_done() {
                return Err(HarnessError::Incomplete {
                    machine: machine.name.clone(),
                    remaining: machine.steps.len(),
                });
            }
            if !machine.sniffer && !machine.received.is_empty() {
                return Err(HarnessError::UnexpectedTraffic {
                    machine: machine.name.clone(),
                    count: machine.received.len(),
                });
            }
        }
        Ok(())
    }
}

/// Split an `ip[/prefix][:port]` station string into its tuple and prefix.
fn parse_station(address: &str) -> Result<(SocketAddrV4, u8), AddressError> {
    let parsed: Address = address.parse()?;
    let tuple = parsed.addr_tuple()?;
    let prefix = match &parsed {
        Address::LocalStation(station) => station.prefix().unwrap_or(32),
        _ => 32,
    };
    Ok((tuple, prefix))
}

/// A station speaking raw BVLL frames: codec over multiplexer, no BIP
/// layer. The scripts of the NAK tests are written against this.
pub fn bvll_station<C: TimeSource<TimerBinding>>(
    rt: &mut Runtime<C>,
    network: NetworkId,
    address: &str,
) -> Result<StackId, HarnessError> {
    let (tuple, prefix) = parse_station(address)?;
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(AnnexJCodec::new()),
        Box::new(UdpMultiplexer::new(tuple, prefix)?),
    ];
    Ok(rt.add_stack(layers, network, NodeConfig::new(tuple))?)
}

/// A promiscuous, spoof-capable BVLL station for wire observation.
pub fn sniffer_station<C: TimeSource<TimerBinding>>(
    rt: &mut Runtime<C>,
    network: NetworkId,
    address: &str,
) -> Result<StackId, HarnessError> {
    let (tuple, prefix) = parse_station(address)?;
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(AnnexJCodec::new()),
        Box::new(UdpMultiplexer::new(tuple, prefix)?),
    ];
    Ok(rt.add_stack(
        layers,
        network,
        NodeConfig::new(tuple).promiscuous().spoofing(),
    )?)
}

/// A full simple-node stack: NPDUs in and out.
pub fn bip_simple_station<C: TimeSource<TimerBinding>>(
    rt: &mut Runtime<C>,
    network: NetworkId,
    address: &str,
) -> Result<StackId, HarnessError> {
    let (tuple, prefix) = parse_station(address)?;
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(BipSimple::new()),
        Box::new(AnnexJCodec::new()),
        Box::new(UdpMultiplexer::new(tuple, prefix)?),
    ];
    Ok(rt.add_stack(layers, network, NodeConfig::new(tuple))?)
}

/// A foreign-device stack configured against a BBMD.
pub fn bip_foreign_station<C: TimeSource<TimerBinding>>(
    rt: &mut Runtime<C>,
    network: NetworkId,
    address: &str,
    bbmd: &str,
    ttl: u16,
) -> Result<StackId, HarnessError> {
    let (tuple, prefix) = parse_station(address)?;
    let (bbmd_tuple, _) = parse_station(bbmd)?;
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(BipForeign::new(bbmd_tuple, ttl)?),
        Box::new(AnnexJCodec::new()),
        Box::new(UdpMultiplexer::new(tuple, prefix)?),
    ];
    Ok(rt.add_stack(layers, network, NodeConfig::new(tuple))?)
}

/// A BBMD stack with its peers already in the BDT. A peer given without a
/// prefix becomes an all-ones (two-hop) entry, matching how BBMD
/// peerings are usually configured.
pub fn bbmd_station<C: TimeSource<TimerBinding>>(
    rt: &mut Runtime<C>,
    network: NetworkId,
    address: &str,
    peers: &[&str],
) -> Result<StackId, HarnessError> {
    let (tuple, prefix) = parse_station(address)?;
    let mut bbmd = BipBbmd::new(tuple);
    for peer in peers {
        let (peer_tuple, peer_prefix) = parse_station(peer)?;
        bbmd.add_peer(BdtEntry::with_prefix(peer_tuple, peer_prefix))?;
    }
    let layers: Vec<Box<dyn Layer>> = vec![
        Box::new(bbmd),
        Box::new(AnnexJCodec::new()),
        Box::new(UdpMultiplexer::new(tuple, prefix)?),
    ];
    Ok(rt.add_stack(layers, network, NodeConfig::new(tuple))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::bvll::BvllFrame;
    use crate::clock::TimeMachine;
    use crate::iocb::IocbState;
    use crate::runtime::SimRuntime;
    use crate::vlan::VirtualIpNetwork;

    fn runtime_with_vlan() -> (SimRuntime, NetworkId) {
        let mut rt = Runtime::new(TimeMachine::new());
        let vlan = rt.add_network(VirtualIpNetwork::new(
            "vlan",
            "192.168.1.0".parse().unwrap(),
            24,
        ));
        (rt, vlan)
    }

    #[test]
    fn test_send_and_expect_between_stations() {
        let (mut rt, vlan) = runtime_with_vlan();
        let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
        let iut = bvll_station(&mut rt, vlan, "192.168.1.3/24").unwrap();
        rt.start();

        let npdu = Bytes::from_static(b"\x01");
        let mut group = StateMachineGroup::new();

        let mut td_machine = ClientStateMachine::new("td", td);
        td_machine.send(
            Pdu::new(BvllFrame::OriginalUnicastNpdu(npdu.clone())).with_destination(
                Address::local_station("192.168.1.3:47808".parse().unwrap()),
            ),
        );
        group.append(td_machine);

        let mut iut_machine = ClientStateMachine::new("iut", iut);
        iut_machine.expect(PduExpect::payload(BvllFrame::OriginalUnicastNpdu(npdu)));
        group.append(iut_machine);

        group.run(&mut rt, Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_unexpected_traffic_fails_strict_machines() {
        let (mut rt, vlan) = runtime_with_vlan();
        let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
        let iut = bvll_station(&mut rt, vlan, "192.168.1.3/24").unwrap();
        rt.start();

        let mut group = StateMachineGroup::new();
        let mut td_machine = ClientStateMachine::new("td", td);
        td_machine.send(
            Pdu::new(BvllFrame::OriginalBroadcastNpdu(Bytes::from_static(b"\x01")))
                .with_destination(Address::LocalBroadcast),
        );
        group.append(td_machine);
        group.append(ClientStateMachine::new("iut", iut));

        assert!(matches!(
            group.run(&mut rt, Duration::from_secs(10)),
            Err(HarnessError::UnexpectedTraffic { .. })
        ));
    }

    #[test]
    fn test_sniffer_keeps_everything() {
        let (mut rt, vlan) = runtime_with_vlan();
        let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
        let sniffer = sniffer_station(&mut rt, vlan, "192.168.1.254/24").unwrap();
        rt.start();

        let mut group = StateMachineGroup::new();
        let mut td_machine = ClientStateMachine::new("td", td);
        td_machine.send(
            Pdu::new(BvllFrame::OriginalUnicastNpdu(Bytes::from_static(b"\x01")))
                .with_destination(Address::local_station("192.168.1.9:47808".parse().unwrap())),
        );
        group.append(td_machine);
        let sniffer_index = group.append(ClientStateMachine::sniffer("sniffer", sniffer));

        group.run(&mut rt, Duration::from_secs(10)).unwrap();
        assert_eq!(group.machine(sniffer_index).received().len(), 1);
    }

    #[test]
    fn test_call_pairs_reply_with_iocb() {
        let (mut rt, vlan) = runtime_with_vlan();
        let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
        let iut = bip_simple_station(&mut rt, vlan, "192.168.1.3/24").unwrap();
        let _ = iut;
        rt.start();

        let mut group = StateMachineGroup::new();
        let mut td_machine = ClientStateMachine::new("td", td);
        let iocb = td_machine.call(
            Pdu::new(BvllFrame::ReadBroadcastDistributionTable).with_destination(
                Address::local_station("192.168.1.3:47808".parse().unwrap()),
            ),
            PduExpect::payload(BvllFrame::Result(
                crate::bvll::ResultCode::ReadBdtNak,
            )),
        );
        let td_index = group.append(td_machine);

        group.run(&mut rt, Duration::from_secs(10)).unwrap();
        let iocb = group.machine(td_index).iocb(iocb);
        assert_eq!(iocb.state(), IocbState::Completed);
        assert!(iocb.response().is_some());
    }
}
