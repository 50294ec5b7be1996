//! Layered Stack Composition
//!
//! This module implements the client/server binding pattern the whole
//! stack is built from. Each layer exposes two capabilities:
//!
//! - downward: it receives `indication(PDU)` from the layer above and may
//!   emit further downward `request`s;
//! - upward: it receives `confirmation(PDU)` from the layer below and may
//!   emit upward `response`s.
//!
//! Rather than wiring layers to each other with bidirectional references,
//! a [`Stack`] owns its layers top-to-bottom and routes deliveries through
//! a FIFO queue: binding (A, B, C) means A's requests arrive at B as
//! indications, B's requests at C, C's responses at B as confirmations,
//! and so on. Everything a layer emits while handling a delivery is queued
//! and begins propagating only after that delivery completes, which keeps
//! multi-recipient fan-out deterministic.
//!
//! Requests that fall off the bottom of the stack become outbound wire
//! PDUs; responses that rise past the top are collected for the
//! application boundary. A layer error is logged and terminates delivery
//! of that PDU only.

use std::collections::VecDeque;
use std::time::Duration;

use log::{trace, warn};
use thiserror::Error;

use crate::address::AddressError;
use crate::bvll::CodecError;
use crate::clock::{TaskHandle, TimeSource};
use crate::pdu::{Endpoint, Pdu};

/// Index of a stack within its owning runtime.
pub type StackId = usize;

/// Index of a layer within its stack, top first.
pub type LayerId = usize;

/// Result type for layer operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Errors a layer can raise while handling one PDU
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StackError {
    /// Address construction or matching failed.
    #[error("address error: {0}")]
    Address(#[from] AddressError),
    /// BVLL encode/decode failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The PDU carried the wrong payload kind for this layer.
    #[error("{0}: unexpected payload kind")]
    UnexpectedPayload(&'static str),
    /// The destination variant is not routable at this layer.
    #[error("{layer}: invalid destination {destination}")]
    InvalidDestination {
        layer: &'static str,
        destination: Endpoint,
    },
    /// The source endpoint is not usable at this layer.
    #[error("{layer}: invalid source {endpoint}")]
    InvalidSource {
        layer: &'static str,
        endpoint: Endpoint,
    },
    /// Downward traffic on a foreign device that is not registered.
    #[error("foreign device is not registered")]
    NotRegistered,
}

/// Layer-chosen discriminator for its scheduled callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u32);

/// What the runtime needs to route a fired timer back into a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerBinding {
    pub stack: StackId,
    pub layer: LayerId,
    pub token: TimerToken,
}

/// Emission context handed into every layer call.
///
/// Collects the layer's downward and upward emissions and fronts the
/// runtime's clock for `now`/`call_later`/`cancel`.
pub struct Effects<'a> {
    clock: &'a mut dyn TimeSource<TimerBinding>,
    stack: StackId,
    layer: LayerId,
    requests: Vec<Pdu>,
    responses: Vec<Pdu>,
}

impl<'a> Effects<'a> {
    pub fn new(
        clock: &'a mut dyn TimeSource<TimerBinding>,
        stack: StackId,
        layer: LayerId,
    ) -> Self {
        Self {
            clock,
            stack,
            layer,
            requests: Vec::new(),
            responses: Vec::new(),
        }
    }

    /// Emit a PDU downward, toward the wire.
    pub fn request(&mut self, pdu: Pdu) {
        self.requests.push(pdu);
    }

    /// Emit a PDU upward, toward the application.
    pub fn response(&mut self, pdu: Pdu) {
        self.responses.push(pdu);
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule a callback into this layer.
    pub fn call_later(&mut self, delay: Duration, token: TimerToken) -> TaskHandle {
        self.clock.call_later(
            delay,
            TimerBinding {
                stack: self.stack,
                layer: self.layer,
                token,
            },
        )
    }

    /// Cancel a scheduled callback; cancelling a spent handle is benign.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.clock.cancel(handle)
    }

    /// Consume the context, yielding its (requests, responses).
    pub fn into_emissions(self) -> (Vec<Pdu>, Vec<Pdu>) {
        (self.requests, self.responses)
    }
}

/// A stack layer.
///
/// `indication` is the downward call from the client above, `confirmation`
/// the upward call from the server below. Layers must complete
/// synchronously and never block; deferred work goes through
/// [`Effects::call_later`] and arrives back via `timer`.
pub trait Layer {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()>;

    fn confirmation(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()>;

    /// Called once when the owning stack starts.
    fn start(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        let _ = fx;
        Ok(())
    }

    /// Called when the owning stack shuts down; cancel pending callbacks
    /// here.
    fn stop(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        let _ = fx;
        Ok(())
    }

    /// A callback scheduled with [`Effects::call_later`] came due.
    fn timer(&mut self, token: TimerToken, fx: &mut Effects<'_>) -> Result<()> {
        let _ = (token, fx);
        Ok(())
    }
}

/// A pass-through layer that logs both directions.
pub struct DebugLayer {
    label: &'static str,
}

impl DebugLayer {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl Layer for DebugLayer {
    fn name(&self) -> &'static str {
        self.label
    }

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        trace!("{}: indication {} -> {}", self.label, pdu.source, pdu.destination);
        fx.request(pdu);
        Ok(())
    }

    fn confirmation(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        trace!("{}: confirmation {} -> {}", self.label, pdu.source, pdu.destination);
        fx.response(pdu);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

struct Queued {
    layer: LayerId,
    direction: Direction,
    pdu: Pdu,
}

/// PDUs that left a stack during a pump: outbound toward the wire and
/// upward toward the application.
#[derive(Default)]
pub struct StackOutput {
    pub outbound: Vec<Pdu>,
    pub upward: Vec<Pdu>,
}

impl StackOutput {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.upward.is_empty()
    }

    fn absorb(&mut self, mut other: StackOutput) {
        self.outbound.append(&mut other.outbound);
        self.upward.append(&mut other.upward);
    }
}

/// A bound sequence of layers plus its delivery queue.
pub struct Stack {
    id: StackId,
    layers: Vec<Box<dyn Layer>>,
    queue: VecDeque<Queued>,
}

impl Stack {
    /// Bind layers top-to-bottom.
    pub fn bind(id: StackId, layers: Vec<Box<dyn Layer>>) -> Self {
        assert!(!layers.is_empty(), "a stack needs at least one layer");
        Self {
            id,
            layers,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> StackId {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Inject an application request at the top of the stack.
    pub fn accept_request(&mut self, pdu: Pdu) {
        self.queue.push_back(Queued {
            layer: 0,
            direction: Direction::Down,
            pdu,
        });
    }

    /// Inject a wire delivery at the bottom of the stack.
    pub fn accept_inbound(&mut self, pdu: Pdu) {
        self.queue.push_back(Queued {
            layer: self.layers.len() - 1,
            direction: Direction::Up,
            pdu,
        });
    }

    /// Drive queued deliveries to quiescence.
    pub fn pump(&mut self, clock: &mut dyn TimeSource<TimerBinding>) -> StackOutput {
        let mut output = StackOutput::default();
        while let Some(item) = self.queue.pop_front() {
            let mut fx = Effects::new(&mut *clock, self.id, item.layer);
            let layer = &mut self.layers[item.layer];
            let result = match item.direction {
                Direction::Down => layer.indication(item.pdu, &mut fx),
                Direction::Up => layer.confirmation(item.pdu, &mut fx),
            };
            if let Err(err) = result {
                // terminates delivery of this PDU only
                warn!("stack {}: {}: {}", self.id, layer.name(), err);
            }
            self.route(fx, item.layer, &mut output);
        }
        output
    }

    /// Deliver a due timer callback and pump whatever it emitted.
    pub fn fire_timer(
        &mut self,
        layer: LayerId,
        token: TimerToken,
        clock: &mut dyn TimeSource<TimerBinding>,
    ) -> StackOutput {
        let mut output = StackOutput::default();
        if layer >= self.layers.len() {
            warn!("stack {}: timer for unknown layer {}", self.id, layer);
            return output;
        }
        let mut fx = Effects::new(&mut *clock, self.id, layer);
        if let Err(err) = self.layers[layer].timer(token, &mut fx) {
            warn!("stack {}: {}: timer: {}", self.id, self.layers[layer].name(), err);
        }
        self.route(fx, layer, &mut output);
        output.absorb(self.pump(clock));
        output
    }

    /// Run every layer's start hook, top to bottom, and pump.
    pub fn start(&mut self, clock: &mut dyn TimeSource<TimerBinding>) -> StackOutput {
        let mut output = StackOutput::default();
        for index in 0..self.layers.len() {
            let mut fx = Effects::new(&mut *clock, self.id, index);
            if let Err(err) = self.layers[index].start(&mut fx) {
                warn!("stack {}: {}: start: {}", self.id, self.layers[index].name(), err);
            }
            self.route(fx, index, &mut output);
        }
        output.absorb(self.pump(clock));
        output
    }

    /// Run every layer's stop hook so pending callbacks get cancelled,
    /// then drain the queue.
    pub fn stop(&mut self, clock: &mut dyn TimeSource<TimerBinding>) -> StackOutput {
        let mut output = StackOutput::default();
        for index in 0..self.layers.len() {
            let mut fx = Effects::new(&mut *clock, self.id, index);
            if let Err(err) = self.layers[index].stop(&mut fx) {
                warn!("stack {}: {}: stop: {}", self.id, self.layers[index].name(), err);
            }
            self.route(fx, index, &mut output);
        }
        output.absorb(self.pump(clock));
        output
    }

    fn route(&mut self, fx: Effects<'_>, from: LayerId, output: &mut StackOutput) {
        let Effects {
            requests,
            responses,
            ..
        } = fx;
        for pdu in requests {
            if from + 1 < self.layers.len() {
                self.queue.push_back(Queued {
                    layer: from + 1,
                    direction: Direction::Down,
                    pdu,
                });
            } else {
                output.outbound.push(pdu);
            }
        }
        for pdu in responses {
            if from > 0 {
                self.queue.push_back(Queued {
                    layer: from - 1,
                    direction: Direction::Up,
                    pdu,
                });
            } else {
                output.upward.push(pdu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::clock::TimeMachine;

    /// Tags every PDU it sees so tests can observe traversal order.
    struct Tagging {
        tag: &'static str,
    }

    fn tagged(pdu: &Pdu, tag: &str) -> Pdu {
        let mut data = pdu.payload.raw().unwrap().to_vec();
        data.extend_from_slice(tag.as_bytes());
        Pdu::derived_from(pdu, data, pdu.source.clone(), pdu.destination.clone())
    }

    impl Layer for Tagging {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
            let out = tagged(&pdu, self.tag);
            fx.request(out);
            Ok(())
        }

        fn confirmation(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
            let out = tagged(&pdu, self.tag);
            fx.response(out);
            Ok(())
        }
    }

    fn payload_of(pdu: &Pdu) -> Vec<u8> {
        pdu.payload.raw().unwrap().to_vec()
    }

    #[test]
    fn test_bind_routes_down_and_up() {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut stack = Stack::bind(
            0,
            vec![
                Box::new(Tagging { tag: "a" }),
                Box::new(Tagging { tag: "b" }),
                Box::new(Tagging { tag: "c" }),
            ],
        );

        stack.accept_request(Pdu::new(Bytes::from_static(b"-")));
        let output = stack.pump(&mut clock);
        assert_eq!(output.outbound.len(), 1);
        assert_eq!(payload_of(&output.outbound[0]), b"-abc");

        stack.accept_inbound(Pdu::new(Bytes::from_static(b"+")));
        let output = stack.pump(&mut clock);
        assert_eq!(output.upward.len(), 1);
        assert_eq!(payload_of(&output.upward[0]), b"+cba");
    }

    /// A layer that fans out two requests per indication.
    struct FanOut;

    impl Layer for FanOut {
        fn name(&self) -> &'static str {
            "fanout"
        }

        fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
            fx.request(tagged(&pdu, "1"));
            fx.request(tagged(&pdu, "2"));
            Ok(())
        }

        fn confirmation(&mut self, _pdu: Pdu, _fx: &mut Effects<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fan_out_preserves_emission_order() {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut stack = Stack::bind(
            0,
            vec![Box::new(FanOut), Box::new(Tagging { tag: "x" })],
        );

        stack.accept_request(Pdu::new(Bytes::from_static(b"-")));
        let output = stack.pump(&mut clock);
        let payloads: Vec<Vec<u8>> = output.outbound.iter().map(payload_of).collect();
        assert_eq!(payloads, vec![b"-1x".to_vec(), b"-2x".to_vec()]);
    }

    /// Fails on every even-numbered delivery.
    struct Flaky {
        seen: usize,
    }

    impl Layer for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
            self.seen += 1;
            if self.seen % 2 == 0 {
                return Err(StackError::UnexpectedPayload("flaky"));
            }
            fx.request(pdu);
            Ok(())
        }

        fn confirmation(&mut self, _pdu: Pdu, _fx: &mut Effects<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_layer_error_drops_that_pdu_only() {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut stack = Stack::bind(0, vec![Box::new(Flaky { seen: 0 })]);

        stack.accept_request(Pdu::new(Bytes::from_static(b"1")));
        stack.accept_request(Pdu::new(Bytes::from_static(b"2")));
        stack.accept_request(Pdu::new(Bytes::from_static(b"3")));
        let output = stack.pump(&mut clock);
        let payloads: Vec<Vec<u8>> = output.outbound.iter().map(payload_of).collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn test_debug_layer_passes_through() {
        let mut clock: TimeMachine<TimerBinding> = TimeMachine::new();
        let mut stack = Stack::bind(
            0,
            vec![Box::new(DebugLayer::new("dbg")), Box::new(Tagging { tag: "z" })],
        );
        stack.accept_request(Pdu::new(Bytes::from_static(b"-")));
        let output = stack.pump(&mut clock);
        assert_eq!(payload_of(&output.outbound[0]), b"-z");
    }
}
