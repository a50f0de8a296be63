//! Sliding-window rate limiting with burst caps and cooldowns.
//!
//! Each key keeps the timestamps of its admitted requests inside the current
//! window plus a fixed-window burst counter. Exceeding either limit denies
//! the request and places the key in cooldown; requests during cooldown are
//! denied without touching the window. Denied requests never consume a slot.
//!
//! [`RateGovernor`] applies a per-principal-per-resource budget and a
//! per-resource aggregate budget in one step.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Limits for one rate key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests admitted per `window`.
    pub max_requests: u32,
    pub window: Duration,
    /// Requests admitted per `burst_window`, if capped.
    pub burst_limit: Option<u32>,
    pub burst_window: Duration,
    /// Minimum denial period once a limit is hit.
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            burst_limit: None,
            burst_window: Duration::from_secs(1),
            cooldown: Duration::ZERO,
        }
    }
}

/// Serializable aggregate budget, applied per resource across principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateRateSettings {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for AggregateRateSettings {
    fn default() -> Self {
        Self {
            max_requests: 600,
            window_secs: 60,
        }
    }
}

impl AggregateRateSettings {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.max_requests,
            window: Duration::from_secs(self.window_secs),
            ..RateLimitConfig::default()
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until a retry can succeed; zero when allowed.
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
        }
    }

    fn deny(wait: Duration) -> Self {
        Self {
            allowed: false,
            retry_after_secs: ceil_secs(wait),
        }
    }
}

/// Round up to whole seconds, at least one.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug, Default)]
struct WindowState {
    hits: VecDeque<Instant>,
    burst_started: Option<Instant>,
    burst_count: u32,
    cooldown_until: Option<Instant>,
}

/// Per-key sliding-window limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, WindowState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, config: &RateLimitConfig) -> RateDecision {
        self.check_at(key, config, Instant::now())
    }

    /// Check `key` against `config` at `now`, consuming a slot if allowed.
    pub fn check_at(&self, key: &str, config: &RateLimitConfig, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let state = entry.value_mut();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return RateDecision::deny(until - now);
            }
            state.cooldown_until = None;
        }

        while let Some(&front) = state.hits.front() {
            if now.saturating_duration_since(front) >= config.window {
                state.hits.pop_front();
            } else {
                break;
            }
        }

        if let Some(started) = state.burst_started
            && now.saturating_duration_since(started) >= config.burst_window
        {
            state.burst_started = None;
            state.burst_count = 0;
        }

        let window_wait = if state.hits.len() as u64 >= u64::from(config.max_requests) {
            state
                .hits
                .front()
                .map(|&oldest| config.window.saturating_sub(now.saturating_duration_since(oldest)))
        } else {
            None
        };

        let burst_wait = match (config.burst_limit, state.burst_started) {
            (Some(limit), Some(started)) if state.burst_count >= limit => Some(
                config
                    .burst_window
                    .saturating_sub(now.saturating_duration_since(started)),
            ),
            _ => None,
        };

        if let Some(wait) = window_wait.into_iter().chain(burst_wait).max() {
            let wait = wait.max(config.cooldown);
            state.cooldown_until = Some(now + wait);
            tracing::debug!(key = key, retry_after_secs = ceil_secs(wait), "rate limit exceeded");
            return RateDecision::deny(wait);
        }

        state.hits.push_back(now);
        if state.burst_started.is_none() {
            state.burst_started = Some(now);
        }
        state.burst_count += 1;
        RateDecision::allow()
    }

    /// Give back the most recent slot for `key`.
    pub fn release(&self, key: &str) {
        if let Some(mut state) = self.windows.get_mut(key) {
            state.hits.pop_back();
            state.burst_count = state.burst_count.saturating_sub(1);
        }
    }

    /// Admitted requests currently inside the window for `key`.
    pub fn count(&self, key: &str) -> usize {
        self.windows.get(key).map(|s| s.hits.len()).unwrap_or(0)
    }

    /// Drop keys with no activity in the last `idle`.
    pub fn prune_at(&self, now: Instant, idle: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| {
            let last = state.hits.back().copied().or(state.burst_started);
            let cooling = state.cooldown_until.is_some_and(|until| until > now);
            cooling || last.is_some_and(|t| now.saturating_duration_since(t) < idle)
        });
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Two-level governor: per-principal-per-resource and per-resource
/// aggregate budgets checked together.
#[derive(Debug)]
pub struct RateGovernor {
    limiter: RateLimiter,
    aggregate: RateLimitConfig,
}

impl RateGovernor {
    pub fn new(aggregate: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(),
            aggregate,
        }
    }

    pub fn check(&self, principal: &str, resource: &str, config: &RateLimitConfig) -> RateDecision {
        self.check_at(principal, resource, config, Instant::now())
    }

    /// Both budgets must admit the request. If the aggregate denies, the
    /// principal's slot is given back.
    pub fn check_at(
        &self,
        principal: &str,
        resource: &str,
        config: &RateLimitConfig,
        now: Instant,
    ) -> RateDecision {
        // Length prefix keeps ids containing ':' from sharing a window.
        let principal_key = format!("p:{}:{principal}:{resource}", principal.len());
        let decision = self.limiter.check_at(&principal_key, config, now);
        if !decision.allowed {
            return decision;
        }

        let aggregate = self
            .limiter
            .check_at(&format!("r:{resource}"), &self.aggregate, now);
        if !aggregate.allowed {
            self.limiter.release(&principal_key);
            return aggregate;
        }
        decision
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Reclaim idle windows; the idle horizon is the aggregate window.
    pub fn prune_at(&self, now: Instant) -> usize {
        self.limiter.prune_at(now, self.aggregate.window)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
