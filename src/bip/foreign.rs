//! Foreign-Device Registration
//!
//! A foreign device lives on a subnet without a BBMD and registers with a
//! remote one to take part in broadcasts. The layer is a small state
//! machine:
//!
//! ```text
//! IDLE --start--> REGISTERING --Result 0x0000--> REGISTERED
//!                     |  retransmit 5s/10s/20s (capped)
//!                     +--retries exhausted / NAK--> UNREGISTERED
//! ```
//!
//! While REGISTERED the registration is renewed at 4/5 of the TTL. Only a
//! REGISTERED device accepts downward traffic: unicasts go out directly,
//! broadcasts of any scope are handed to the BBMD as
//! Distribute-Broadcast-To-Network.

use std::net::SocketAddrV4;

use log::{debug, warn};

use crate::address::Address;
use crate::bip::{
    BipError, MAX_REGISTRATION_ATTEMPTS, REGISTRATION_RETRY_SCHEDULE, REGISTRATION_TIMEOUT_CODE,
};
use crate::bvll::{BvllFrame, ResultCode};
use crate::clock::TaskHandle;
use crate::comm::{Effects, Layer, Result, StackError, TimerToken};
use crate::pdu::{Payload, Pdu, PduFlags};
use std::time::Duration;

const TOKEN_RETRY: TimerToken = TimerToken(1);
const TOKEN_RENEW: TimerToken = TimerToken(2);

/// Registration lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    Registering,
    Registered,
    Unregistered,
}

/// Foreign-device role: registration, renewal and broadcast relay.
#[derive(Debug)]
pub struct BipForeign {
    bbmd: SocketAddrV4,
    ttl: u16,
    state: RegistrationState,
    attempts: u8,
    retry: Option<TaskHandle>,
    renewal: Option<TaskHandle>,
}

impl BipForeign {
    /// Configure against a BBMD with a TTL in 1..=65535 seconds.
    pub fn new(bbmd: SocketAddrV4, ttl: u16) -> std::result::Result<Self, BipError> {
        if ttl == 0 {
            return Err(BipError::InvalidTtl);
        }
        Ok(Self {
            bbmd,
            ttl,
            state: RegistrationState::Idle,
            attempts: 0,
            retry: None,
            renewal: None,
        })
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn bbmd_address(&self) -> SocketAddrV4 {
        self.bbmd
    }

    fn renewal_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl) * 4 / 5)
    }

    fn send_registration(&mut self, fx: &mut Effects<'_>) {
        fx.request(
            Pdu::new(BvllFrame::RegisterForeignDevice { ttl: self.ttl })
                .with_destination(Address::local_station(self.bbmd))
                .with_flags(PduFlags::EXPECTING_REPLY),
        );
        let index = usize::from(self.attempts).min(REGISTRATION_RETRY_SCHEDULE.len() - 1);
        self.attempts += 1;
        self.retry = Some(fx.call_later(REGISTRATION_RETRY_SCHEDULE[index], TOKEN_RETRY));
    }

    fn cancel_timers(&mut self, fx: &mut Effects<'_>) {
        if let Some(handle) = self.retry.take() {
            fx.cancel(handle);
        }
        if let Some(handle) = self.renewal.take() {
            fx.cancel(handle);
        }
    }

    fn give_up(&mut self, fx: &mut Effects<'_>) {
        warn!(
            "{}: no registration answer from {} after {} attempts",
            self.name(),
            self.bbmd,
            self.attempts
        );
        self.cancel_timers(fx);
        self.state = RegistrationState::Unregistered;
        fx.response(Pdu::new(BvllFrame::Result(ResultCode::from(
            REGISTRATION_TIMEOUT_CODE,
        ))));
    }
}

impl Layer for BipForeign {
    fn name(&self) -> &'static str {
        "bip-foreign"
    }

    fn start(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        self.state = RegistrationState::Registering;
        self.attempts = 0;
        self.send_registration(fx);
        Ok(())
    }

    fn stop(&mut self, fx: &mut Effects<'_>) -> Result<()> {
        self.cancel_timers(fx);
        self.state = RegistrationState::Idle;
        self.attempts = 0;
        Ok(())
    }

    fn timer(&mut self, token: TimerToken, fx: &mut Effects<'_>) -> Result<()> {
        match token {
            TOKEN_RETRY => {
                self.retry = None;
                if !matches!(
                    self.state,
                    RegistrationState::Registering | RegistrationState::Registered
                ) {
                    return Ok(());
                }
                if self.attempts >= MAX_REGISTRATION_ATTEMPTS {
                    self.give_up(fx);
                } else {
                    self.send_registration(fx);
                }
            }
            TOKEN_RENEW => {
                self.renewal = None;
                if self.state == RegistrationState::Registered {
                    self.attempts = 0;
                    self.send_registration(fx);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn indication(&mut self, pdu: Pdu, fx: &mut Effects<'_>) -> Result<()> {
        if self.state != RegistrationState::Registered {
            return Err(StackError::NotRegistered);
        }
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
            Some(dest) if dest.is_broadcast() => {
                // all broadcast scopes go through the BBMD
                fx.request(Pdu::derived_from(
                    &pdu,
                    BvllFrame::DistributeBroadcastToNetwork(npdu.clone()),
                    pdu.source.clone(),
                    Address::local_station(self.bbmd),
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
            BvllFrame::Result(code) => {
                // only the BBMD's answer to our registration matters
                let from_bbmd = pdu
                    .source
                    .address()
                    .and_then(|a| a.addr_tuple().ok())
                    .map(|t| t == self.bbmd)
                    .unwrap_or(false);
                if !from_bbmd
                    || !matches!(
                        self.state,
                        RegistrationState::Registering | RegistrationState::Registered
                    )
                {
                    debug!("{}: dropping unsolicited {} from {}", self.name(), code, pdu.source);
                    return Ok(());
                }
                if code == ResultCode::Success {
                    if self.state == RegistrationState::Registering {
                        debug!("{}: registered with {} (ttl {}s)", self.name(), self.bbmd, self.ttl);
                    }
                    self.cancel_timers(fx);
                    self.state = RegistrationState::Registered;
                    self.attempts = 0;
                    self.renewal = Some(fx.call_later(self.renewal_delay(), TOKEN_RENEW));
                } else {
                    warn!("{}: registration refused by {}: {}", self.name(), self.bbmd, code);
                    self.cancel_timers(fx);
                    self.state = RegistrationState::Unregistered;
                    fx.response(Pdu::derived_from(
                        &pdu,
                        BvllFrame::Result(code),
                        pdu.source.clone(),
                        pdu.destination.clone(),
                    ));
                }
            }
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
            other => {
                // not a BBMD, not interested
                debug!("{}: dropping {} from {}", self.name(), other.function(), pdu.source);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::clock::{TimeMachine, TimeSource};
    use crate::comm::TimerBinding;
    use crate::pdu::Endpoint;

    const MAX: Duration = Duration::from_secs(3600);

    fn bbmd() -> SocketAddrV4 {
        "192.168.8.3:47808".parse().unwrap()
    }

    fn foreign() -> BipForeign {
        BipForeign::new(bbmd(), 30).unwrap()
    }

    fn success_result() -> Pdu {
        Pdu::new(BvllFrame::Result(ResultCode::Success))
            .with_source(Address::local_station(bbmd()))
    }

    fn registration_count(pdus: &[Pdu]) -> usize {
        pdus.iter()
            .filter(|p| {
                matches!(
                    p.payload.bvll(),
                    Some(BvllFrame::RegisterForeignDevice { .. })
                )
            })
            .count()
    }

    /// Drive one layer call and collect (requests, responses).
    fn with_fx<F>(clock: &mut TimeMachine<TimerBinding>, f: F) -> (Vec<Pdu>, Vec<Pdu>)
    where
        F: FnOnce(&mut Effects<'_>),
    {
        let mut fx = Effects::new(clock, 0, 0);
        f(&mut fx);
        fx.into_emissions()
    }

    #[test]
    fn test_rejects_zero_ttl() {
        assert_eq!(
            BipForeign::new(bbmd(), 0).unwrap_err(),
            BipError::InvalidTtl
        );
    }

    #[test]
    fn test_start_sends_registration() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let (downs, _) = with_fx(&mut clock, |fx| fd.start(fx).unwrap());

        assert_eq!(fd.state(), RegistrationState::Registering);
        assert_eq!(registration_count(&downs), 1);
        assert_eq!(
            downs[0].destination,
            Endpoint::Address(Address::local_station(bbmd()))
        );
        assert!(downs[0].flags.contains(PduFlags::EXPECTING_REPLY));
        // first retransmit is queued for five seconds out
        assert_eq!(clock.pending(), 1);
    }

    #[test]
    fn test_retransmit_schedule_then_unregistered() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());

        let mut fire_times = Vec::new();
        let mut surfaced = Vec::new();
        while let Some((at, binding)) = clock.next_due(MAX) {
            fire_times.push(at.as_secs());
            let (_, ups) = with_fx(&mut clock, |fx| fd.timer(binding.token, fx).unwrap());
            surfaced.extend(ups);
        }

        // 5s, then +10s, then +20s, then the capped 20s tail fires the
        // give-up
        assert_eq!(fire_times, vec![5, 15, 35, 55]);
        assert_eq!(fd.state(), RegistrationState::Unregistered);
        assert_eq!(surfaced.len(), 1);
        assert_eq!(
            surfaced[0].payload,
            Payload::Bvll(BvllFrame::Result(ResultCode::from(0xFFFFu16)))
        );
    }

    #[test]
    fn test_successful_registration_schedules_renewal() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());
        let _ = with_fx(&mut clock, |fx| fd.confirmation(success_result(), fx).unwrap());

        assert_eq!(fd.state(), RegistrationState::Registered);
        // the retry is cancelled, only the renewal remains
        assert_eq!(clock.pending(), 1);
        let (at, binding) = clock.next_due(MAX).unwrap();
        assert_eq!(at, Duration::from_secs(24)); // 0.8 * 30

        // renewal re-registers without leaving REGISTERED
        let (downs, _) = with_fx(&mut clock, |fx| fd.timer(binding.token, fx).unwrap());
        assert_eq!(registration_count(&downs), 1);
        assert_eq!(fd.state(), RegistrationState::Registered);
    }

    #[test]
    fn test_nak_moves_to_unregistered_and_surfaces() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());

        let nak = Pdu::new(BvllFrame::Result(ResultCode::RegisterForeignDeviceNak))
            .with_source(Address::local_station(bbmd()));
        let (_, ups) = with_fx(&mut clock, |fx| fd.confirmation(nak, fx).unwrap());

        assert_eq!(fd.state(), RegistrationState::Unregistered);
        assert_eq!(
            ups[0].payload,
            Payload::Bvll(BvllFrame::Result(ResultCode::RegisterForeignDeviceNak))
        );
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_result_from_stranger_is_ignored() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());

        let stranger = Pdu::new(BvllFrame::Result(ResultCode::Success))
            .with_source(Address::local_station("192.168.8.9:47808".parse().unwrap()));
        let _ = with_fx(&mut clock, |fx| fd.confirmation(stranger, fx).unwrap());
        assert_eq!(fd.state(), RegistrationState::Registering);
    }

    #[test]
    fn test_downward_gated_on_registered() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();

        let npdu = Pdu::new(Bytes::from_static(b"\x01")).with_destination(Address::LocalBroadcast);
        let mut fx = Effects::new(&mut clock, 0, 0);
        assert!(matches!(
            fd.indication(npdu.clone(), &mut fx),
            Err(StackError::NotRegistered)
        ));
        drop(fx);

        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());
        let _ = with_fx(&mut clock, |fx| fd.confirmation(success_result(), fx).unwrap());

        let (downs, _) = with_fx(&mut clock, |fx| fd.indication(npdu, fx).unwrap());
        assert_eq!(
            downs[0].payload,
            Payload::Bvll(BvllFrame::DistributeBroadcastToNetwork(Bytes::from_static(
                b"\x01"
            )))
        );
        assert_eq!(
            downs[0].destination,
            Endpoint::Address(Address::local_station(bbmd()))
        );

        // unicasts skip the BBMD
        let peer = Address::local_station("192.168.9.7:47808".parse().unwrap());
        let unicast = Pdu::new(Bytes::from_static(b"\x02")).with_destination(peer.clone());
        let (downs, _) = with_fx(&mut clock, |fx| fd.indication(unicast, fx).unwrap());
        assert_eq!(
            downs[0].payload,
            Payload::Bvll(BvllFrame::OriginalUnicastNpdu(Bytes::from_static(b"\x02")))
        );
        assert_eq!(downs[0].destination, Endpoint::Address(peer));
    }

    #[test]
    fn test_stop_cancels_pending_callbacks() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());
        assert_eq!(clock.pending(), 1);

        let _ = with_fx(&mut clock, |fx| fd.stop(fx).unwrap());
        assert_eq!(fd.state(), RegistrationState::Idle);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_management_frames_silently_dropped() {
        let mut clock = TimeMachine::new();
        let mut fd = foreign();
        let _ = with_fx(&mut clock, |fx| fd.start(fx).unwrap());

        let (downs, ups) = with_fx(&mut clock, |fx| {
            fd.confirmation(
                Pdu::new(BvllFrame::ReadBroadcastDistributionTable)
                    .with_source(Address::local_station(bbmd())),
                fx,
            )
            .unwrap()
        });
        assert!(downs.is_empty());
        assert!(ups.is_empty());
    }
}
