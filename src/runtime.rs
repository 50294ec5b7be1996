//! Cooperative Event Loop
//!
//! One [`Runtime`] owns everything a scenario needs: the clock, the
//! virtual networks and routers, and every protocol stack with its node
//! attachment. All stack deliveries, wire deliveries and timer firings
//! happen on this single logical loop, in deterministic order:
//!
//! - [`Runtime::settle`] pumps stack queues and the wire until nothing is
//!   in flight;
//! - [`Runtime::run_time_machine`] alternates due-timer dispatch (strict
//!   (time, insertion) order) with settling until the horizon, after
//!   which no callback at or before the horizon remains pending.
//!
//! Datagrams leaving the bottom of a stack are delivered on the stack's
//! network; destinations outside the subnet are offered to the routers.
//! PDUs rising past the top of a stack land in that stack's upward inbox
//! for the application (or the test harness) to collect.

use std::time::Duration;

use log::warn;

use crate::clock::{TimeMachine, TimeSource};
use crate::comm::{Layer, Stack, StackId, StackOutput, TimerBinding};
use crate::pdu::{Payload, Pdu};
use crate::vlan::{
    Datagram, Delivery, NetworkId, NodeId, VirtualIpNetwork, VirtualIpRouter, VlanError,
};
use std::net::SocketAddrV4;

/// Node attachment parameters for a stack.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub address: SocketAddrV4,
    pub promiscuous: bool,
    pub spoofing: bool,
}

impl NodeConfig {
    pub fn new(address: SocketAddrV4) -> Self {
        Self {
            address,
            promiscuous: false,
            spoofing: false,
        }
    }

    pub fn promiscuous(mut self) -> Self {
        self.promiscuous = true;
        self
    }

    pub fn spoofing(mut self) -> Self {
        self.spoofing = true;
        self
    }
}

struct StackEntry {
    stack: Stack,
    network: NetworkId,
    node: NodeId,
    inbox: Vec<Pdu>,
    started: bool,
}

/// The runtime most tests want: virtual networks over a virtual clock.
pub type SimRuntime = Runtime<TimeMachine<TimerBinding>>;

/// Owner of clock, networks, routers and stacks.
pub struct Runtime<C: TimeSource<TimerBinding>> {
    clock: C,
    networks: Vec<VirtualIpNetwork>,
    routers: Vec<VirtualIpRouter>,
    stacks: Vec<StackEntry>,
}

impl<C: TimeSource<TimerBinding>> Runtime<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            networks: Vec::new(),
            routers: Vec::new(),
            stacks: Vec::new(),
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn add_network(&mut self, network: VirtualIpNetwork) -> NetworkId {
        self.networks.push(network);
        self.networks.len() - 1
    }

    pub fn network(&self, id: NetworkId) -> &VirtualIpNetwork {
        &self.networks[id]
    }

    pub fn network_mut(&mut self, id: NetworkId) -> &mut VirtualIpNetwork {
        &mut self.networks[id]
    }

    pub fn add_router(&mut self, router: VirtualIpRouter) -> usize {
        self.routers.push(router);
        self.routers.len() - 1
    }

    /// Bind `layers` into a stack and attach it to a node on `network`.
    pub fn add_stack(
        &mut self,
        layers: Vec<Box<dyn Layer>>,
        network: NetworkId,
        node: NodeConfig,
    ) -> Result<StackId, VlanError> {
        let node_id =
            self.networks[network].add_node(node.address, node.promiscuous, node.spoofing)?;
        let id = self.stacks.len();
        self.stacks.push(StackEntry {
            stack: Stack::bind(id, layers),
            network,
            node: node_id,
            inbox: Vec::new(),
            started: false,
        });
        Ok(id)
    }

    /// Run the start hooks of every stack not yet started and settle the
    /// fallout.
    pub fn start(&mut self) {
        for index in 0..self.stacks.len() {
            if self.stacks[index].started {
                continue;
            }
            self.stacks[index].started = true;
            let output = self.stacks[index].stack.start(&mut self.clock);
            self.dispatch(index, output);
        }
        self.settle();
    }

    /// Run one stack's stop hooks so its pending callbacks drain.
    pub fn stop_stack(&mut self, stack: StackId) {
        let output = self.stacks[stack].stack.stop(&mut self.clock);
        self.dispatch(stack, output);
        self.settle();
    }

    /// Inject an application request at the top of a stack.
    pub fn send(&mut self, stack: StackId, pdu: Pdu) {
        self.stacks[stack].stack.accept_request(pdu);
        self.settle();
    }

    /// Take the PDUs that rose past the top of a stack.
    pub fn take_upward(&mut self, stack: StackId) -> Vec<Pdu> {
        std::mem::take(&mut self.stacks[stack].inbox)
    }

    /// Pump stacks and wire until nothing is in flight.
    pub fn settle(&mut self) {
        loop {
            let mut busy = false;

            for index in 0..self.stacks.len() {
                if !self.stacks[index].stack.is_idle() {
                    busy = true;
                    let output = self.stacks[index].stack.pump(&mut self.clock);
                    self.dispatch(index, output);
                }
            }

            for index in 0..self.stacks.len() {
                let (network, node) = (self.stacks[index].network, self.stacks[index].node);
                for datagram in self.networks[network].drain_node(node) {
                    busy = true;
                    self.stacks[index].stack.accept_inbound(
                        Pdu::new(datagram.payload)
                            .with_source(datagram.source)
                            .with_destination(datagram.destination),
                    );
                }
            }

            if !busy {
                break;
            }
        }
    }

    /// Fire the next timer due at or before `horizon` and settle.
    /// Returns false when nothing is due.
    pub fn fire_next_timer(&mut self, horizon: Duration) -> bool {
        let Some((_, binding)) = self.clock.next_due(horizon) else {
            return false;
        };
        if binding.stack < self.stacks.len() {
            let output =
                self.stacks[binding.stack]
                    .stack
                    .fire_timer(binding.layer, binding.token, &mut self.clock);
            self.dispatch(binding.stack, output);
        } else {
            warn!("timer for unknown stack {}", binding.stack);
        }
        self.settle();
        true
    }

    /// Run `duration` of virtual time: settle, fire every callback due in
    /// the window in (time, insertion) order, and leave the clock at the
    /// horizon.
    pub fn run_time_machine(&mut self, duration: Duration) {
        self.settle();
        let horizon = self.clock.now() + duration;
        while self.fire_next_timer(horizon) {}
        self.clock.advance(horizon);
    }

    /// Move the clock forward without firing anything (the harness uses
    /// this to pin the clock at its deadline).
    pub fn advance_to(&mut self, to: Duration) {
        self.clock.advance(to);
    }

    fn dispatch(&mut self, index: StackId, output: StackOutput) {
        let StackOutput { outbound, upward } = output;
        self.stacks[index].inbox.extend(upward);
        for pdu in outbound {
            self.transmit(index, pdu);
        }
    }

    fn transmit(&mut self, index: StackId, pdu: Pdu) {
        let (Some(source), Some(destination), Payload::Raw(payload)) =
            (pdu.source.tuple(), pdu.destination.tuple(), &pdu.payload)
        else {
            warn!("stack {}: unroutable outbound PDU, dropped", index);
            return;
        };
        let datagram = Datagram {
            source,
            destination,
            payload: payload.clone(),
        };

        let network = self.stacks[index].network;
        let node = self.stacks[index].node;
        let now = self.clock.now();
        match self.networks[network].send(Some(node), datagram.clone(), now) {
            Ok(Delivery::Local) => {}
            Ok(Delivery::NotLocal) => {
                let target = self
                    .routers
                    .iter()
                    .find_map(|router| router.route(network, destination));
                match target {
                    Some(target) => {
                        if let Err(err) = self.networks[target].send(None, datagram, now) {
                            warn!("router delivery failed: {}", err);
                        }
                    }
                    None => warn!(
                        "{}: no route to {}, dropped",
                        self.networks[network].name(),
                        destination
                    ),
                }
            }
            Err(err) => warn!("stack {}: send refused: {}", index, err),
        }
    }
}
