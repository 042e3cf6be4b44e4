//! PING bookkeeping: keepalive probes and round-trip-time estimation.
//!
//! Both share the PING frame. Keepalive payloads are non-negative counters;
//! RTT probes use negative counters, so an ACK can be routed by sign alone.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::KeepAlivePolicy;
use crate::error::{Error, Result};

/// RTT probes sent back to back when data first arrives.
const RTT_INITIAL_BURST: u32 = 4;
/// Minimum spacing between RTT probes after the initial burst.
const RTT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub fn encode_ping_payload(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_ping_payload(payload: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing(i64),
    /// The outstanding PING was not acknowledged in time.
    TimedOut,
}

#[derive(Debug)]
struct KeepAliveState {
    last_activity: Instant,
    /// Payload and deadline of the PING awaiting its ACK.
    in_flight: Option<(i64, Instant)>,
    counter: i64,
}

/// Idle-connection keepalive.
#[derive(Debug)]
pub struct KeepAlive {
    delay: Duration,
    timeout: Duration,
    policy: KeepAlivePolicy,
    state: Mutex<KeepAliveState>,
}

impl KeepAlive {
    pub fn new(delay: Duration, timeout: Duration, policy: KeepAlivePolicy, now: Instant) -> Self {
        Self {
            delay,
            timeout,
            policy,
            state: Mutex::new(KeepAliveState {
                last_activity: now,
                in_flight: None,
                counter: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeepAliveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How often [`KeepAlive::poll`] should run.
    pub fn tick_interval(&self) -> Duration {
        (self.delay.min(self.timeout) / 4).max(Duration::from_millis(1))
    }

    pub fn on_frame_received(&self, now: Instant) {
        self.lock().last_activity = now;
    }

    pub fn poll(&self, now: Instant, active_streams: usize) -> KeepAliveAction {
        let mut state = self.lock();
        if let Some((_, deadline)) = state.in_flight {
            return if now >= deadline {
                KeepAliveAction::TimedOut
            } else {
                KeepAliveAction::Idle
            };
        }

        if self.policy == KeepAlivePolicy::WithActiveRequests && active_streams == 0 {
            return KeepAliveAction::Idle;
        }
        if now.duration_since(state.last_activity) < self.delay {
            return KeepAliveAction::Idle;
        }

        let payload = state.counter;
        state.counter = state.counter.wrapping_add(1) & i64::MAX;
        state.in_flight = Some((payload, now + self.timeout));
        trace!(payload, "sending keepalive PING");
        KeepAliveAction::SendPing(payload)
    }

    /// An ACK for a non-negative payload must answer our outstanding PING.
    pub fn on_ping_ack(&self, payload: i64, now: Instant) -> Result<()> {
        let mut state = self.lock();
        match state.in_flight {
            Some((expected, _)) if expected == payload => {
                state.in_flight = None;
                state.last_activity = now;
                Ok(())
            }
            Some((expected, _)) => Err(Error::protocol(format!(
                "keepalive PING ACK payload {} does not match {}",
                payload, expected
            ))),
            None => Err(Error::protocol(format!("unexpected keepalive PING ACK {}", payload))),
        }
    }
}

#[derive(Debug)]
struct RttState {
    in_flight: Option<(i64, Instant)>,
    next_payload: i64,
    probes_sent: u32,
    last_probe: Option<Instant>,
    min_rtt: Option<Duration>,
}

/// Minimum-RTT estimation from PINGs sent as response data arrives.
#[derive(Debug)]
pub struct RttEstimator {
    enabled: bool,
    state: Mutex<RttState>,
}

impl RttEstimator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(RttState {
                in_flight: None,
                next_payload: -1,
                probes_sent: 0,
                last_probe: None,
                min_rtt: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RttState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// DATA arrived; returns the payload of a probe to send, if one is due.
    pub fn on_data_received(&self, now: Instant) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        let mut state = self.lock();
        if state.in_flight.is_some() {
            return None;
        }
        let due = state.probes_sent < RTT_INITIAL_BURST
            || state
                .last_probe
                .map_or(true, |last| now.duration_since(last) >= RTT_PROBE_INTERVAL);
        if !due {
            return None;
        }

        let payload = state.next_payload;
        state.next_payload = if payload == i64::MIN { -1 } else { payload - 1 };
        state.in_flight = Some((payload, now));
        state.probes_sent = state.probes_sent.saturating_add(1);
        state.last_probe = Some(now);
        Some(payload)
    }

    pub fn on_ping_ack(&self, payload: i64, now: Instant) {
        let mut state = self.lock();
        match state.in_flight {
            Some((expected, sent_at)) if expected == payload => {
                state.in_flight = None;
                let rtt = now.duration_since(sent_at);
                let min_rtt = state.min_rtt.map_or(rtt, |current| current.min(rtt));
                state.min_rtt = Some(min_rtt);
                trace!(rtt_us = rtt.as_micros() as u64, min_rtt_us = min_rtt.as_micros() as u64, "RTT sample");
            }
            _ => debug!(payload, "ignoring unexpected RTT PING ACK"),
        }
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.lock().min_rtt
    }
}
