//! Circuit breaker around the secret store.
//!
//! States:
//! - `Closed`: calls pass through; consecutive store faults are counted.
//! - `Open`: calls fail fast with [`GatewayError::ResourceUnavailable`]
//!   until the open period ends.
//! - `HalfOpen`: one trial call is let through; success closes the
//!   breaker, a store fault reopens it.
//!
//! Only infrastructure faults (see [`VaultError::is_store_fault`]) trip the
//! breaker. "Not found" or a version conflict means the store answered.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use warden_vault::VaultError;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive store faults that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.lock()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), BreakerState::Open { .. })
    }

    /// Run `f` through the breaker.
    pub fn call<T>(&self, f: impl FnOnce() -> warden_vault::Result<T>) -> Result<T> {
        self.call_at(Instant::now(), f)
    }

    pub fn call_at<T>(&self, now: Instant, f: impl FnOnce() -> warden_vault::Result<T>) -> Result<T> {
        self.admit(now)?;
        match f() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_store_fault() {
                    self.on_failure(now, &e);
                } else {
                    self.on_success();
                }
                Err(e.into())
            }
        }
    }

    fn admit(&self, now: Instant) -> Result<()> {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now >= until => {
                *state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                tracing::info!("store breaker half-open, admitting a trial call");
                Ok(())
            }
            BreakerState::Open { until } => Err(GatewayError::ResourceUnavailable {
                retry_after_secs: ceil_secs(until - now),
            }),
            BreakerState::HalfOpen {
                trial_in_flight: true,
            } => Err(GatewayError::ResourceUnavailable {
                retry_after_secs: 1,
            }),
            BreakerState::HalfOpen {
                trial_in_flight: false,
            } => {
                *state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        if matches!(*state, BreakerState::HalfOpen { .. }) {
            tracing::info!("store breaker closed after successful trial call");
        }
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    fn on_failure(&self, now: Instant, error: &VaultError) {
        let open = BreakerState::Open {
            until: now + Duration::from_secs(self.settings.open_secs),
        };
        let mut state = self.lock();
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.settings.failure_threshold {
                    tracing::warn!(failures, error = %error, "store breaker opened");
                    open
                } else {
                    tracing::debug!(failures, error = %error, "store fault");
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(error = %error, "store breaker reopened after failed trial call");
                open
            }
            BreakerState::Open { until } => BreakerState::Open { until },
        };
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
