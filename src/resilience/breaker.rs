//! Per-agent circuit breaker.
//!
//! One breaker instance is shared across all concurrent invocations of an
//! agent. Counters live behind a mutex held only across counter updates,
//! never across an external call.

use std::sync::Mutex;
use std::time::Instant;

use crate::workflow::BreakerPolicy;

/// Breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally; consecutive failures are counted.
    Closed,
    /// Calls are denied until the recovery timeout elapses.
    Open,
    /// One probe call is allowed through; its outcome decides the next state.
    HalfOpen,
}

/// A state change worth announcing to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    HalfOpened,
    Closed,
}

/// Callback invoked outside the lock whenever the breaker changes state.
pub type BreakerListener = Box<dyn Fn(BreakerTransition) + Send + Sync>;

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single half-open probe is outstanding.
    probe_in_flight: bool,
}

/// Three-state circuit breaker with a single half-open probe.
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    inner: Mutex<BreakerInner>,
    listener: Option<BreakerListener>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            listener: None,
        }
    }

    /// Attach a transition listener (used by the engine to publish
    /// `breaker_*` events).
    pub fn with_listener(mut self, listener: BreakerListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Whether a call may proceed right now.
    ///
    /// In `Open`, the first call after the recovery timeout flips the breaker
    /// to `HalfOpen` and is admitted as the probe; concurrent callers are
    /// denied until the probe outcome is recorded.
    pub fn may_invoke(&self) -> bool {
        let transition = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                BreakerState::Closed => return true,
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed() >= self.policy.recovery_timeout())
                        .unwrap_or(true);
                    if !elapsed {
                        return false;
                    }
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Some(BreakerTransition::HalfOpened)
                }
                BreakerState::HalfOpen => {
                    if inner.probe_in_flight {
                        return false;
                    }
                    inner.probe_in_flight = true;
                    None
                }
            }
        };
        self.announce(transition);
        true
    }

    /// Record a successful call (or a remote rejection, which proves the
    /// service reachable and counts the same for breaker purposes).
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                BreakerState::Closed => {
                    inner.failures = 0;
                    None
                }
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                    inner.probe_in_flight = false;
                    Some(BreakerTransition::Closed)
                }
                // The gate denied the call, so nothing should be recording.
                BreakerState::Open => None,
            }
        };
        self.announce(transition);
    }

    /// Record a transport-level failure.
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            match inner.state {
                BreakerState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= self.policy.failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        Some(BreakerTransition::Opened)
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_in_flight = false;
                    Some(BreakerTransition::Opened)
                }
                BreakerState::Open => None,
            }
        };
        self.announce(transition);
    }

    fn announce(&self, transition: Option<BreakerTransition>) {
        if let (Some(listener), Some(transition)) = (self.listener.as_ref(), transition) {
            listener(transition);
        }
    }
}
