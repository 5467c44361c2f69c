//! Circuit breaker for outbound requests.
//!
//! A per-target state machine with three states:
//! - **Closed**: requests flow; a generation window counts outcomes
//! - **Open**: requests are rejected until `timeout` elapses
//! - **HalfOpen**: a bounded number of probes tests recovery
//!
//! Counts are stamped with a generation id. Every state transition (and,
//! while closed, every `interval` tick) starts a new generation and clears
//! the counts; outcomes settling against a stale generation are ignored.

use crate::config::BreakerConfig;
use crate::error::{MeshError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome counters for one generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counts {
    pub requests: u32,
    pub total_failures: u32,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

struct Shared {
    state: State,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Per-target circuit breaker.
pub struct CircuitBreaker {
    target: String,
    cfg: BreakerConfig,
    shared: Mutex<Shared>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, cfg: BreakerConfig) -> Self {
        let expiry = if cfg.interval > Duration::ZERO {
            Some(Instant::now() + cfg.interval)
        } else {
            None
        };

        Self {
            target: target.into(),
            cfg,
            shared: Mutex::new(Shared {
                state: State::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    /// Admits or rejects a request. On admission, returns the generation the
    /// caller must hand back to [`CircuitBreaker::after_request`].
    pub fn before_request(&self) -> Result<u64> {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        self.refresh(&mut shared, now);

        match shared.state {
            State::Closed => {
                shared.counts.on_request();
                Ok(shared.generation)
            }
            State::Open => Err(MeshError::BreakerOpen {
                target: self.target.clone(),
            }),
            State::HalfOpen => {
                if shared.counts.requests >= self.cfg.max_half_open_requests {
                    return Err(MeshError::BreakerOpen {
                        target: self.target.clone(),
                    });
                }
                shared.counts.on_request();
                Ok(shared.generation)
            }
        }
    }

    /// Settles a previously admitted request.
    pub fn after_request(&self, generation: u64, success: bool) {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        self.refresh(&mut shared, now);

        if shared.generation != generation {
            return;
        }

        if success {
            shared.counts.on_success();
            if shared.state == State::HalfOpen
                && shared.counts.consecutive_successes >= self.cfg.max_half_open_requests
            {
                self.transition(&mut shared, State::Closed, now);
            }
        } else {
            shared.counts.on_failure();
            match shared.state {
                State::Closed => {
                    if self.ready_to_trip(&shared.counts) {
                        self.transition(&mut shared, State::Open, now);
                    }
                }
                State::HalfOpen => {
                    self.transition(&mut shared, State::Open, now);
                }
                State::Open => {}
            }
        }
    }

    /// Returns the current state, applying any pending timer transition.
    pub fn state(&self) -> State {
        let mut shared = self.shared.lock();
        let now = Instant::now();
        self.refresh(&mut shared, now);
        shared.state
    }

    /// Returns a snapshot of the current generation's counts.
    pub fn counts(&self) -> Counts {
        self.shared.lock().counts
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.requests < self.cfg.min_requests {
            return false;
        }

        counts.consecutive_failures >= self.cfg.consecutive_failures
            || f64::from(counts.total_failures) / f64::from(counts.requests) > self.cfg.failure_rate
    }

    /// Applies timer-driven transitions: open breakers move to half-open
    /// after `timeout`, closed breakers roll their counting generation every
    /// `interval`.
    fn refresh(&self, shared: &mut Shared, now: Instant) {
        match shared.state {
            State::Open => {
                if shared.expiry.is_some_and(|e| now >= e) {
                    self.transition(shared, State::HalfOpen, now);
                }
            }
            State::Closed => {
                if shared.expiry.is_some_and(|e| now >= e) {
                    shared.generation += 1;
                    shared.counts = Counts::default();
                    shared.expiry = Some(now + self.cfg.interval);
                }
            }
            State::HalfOpen => {}
        }
    }

    fn transition(&self, shared: &mut Shared, to: State, now: Instant) {
        debug!(target = %self.target, from = ?shared.state, to = ?to, "breaker state change");

        shared.state = to;
        shared.generation += 1;
        shared.counts = Counts::default();
        shared.expiry = match to {
            State::Open => Some(now + self.cfg.timeout),
            State::Closed if self.cfg.interval > Duration::ZERO => Some(now + self.cfg.interval),
            _ => None,
        };
    }
}
