//! Access control for Warden.
//!
//! This crate decides *whether* and *how much* a principal may see of a
//! secret. It never touches plaintext or key material:
//!
//! - **[`policy`]** -- Static per-role capability table and principal
//!   assignments, loadable from TOML.
//! - **[`decision`]** -- Ordered, short-circuiting decision engine producing
//!   [`DecisionOutcome`] values and exactly one audit event per evaluation.
//! - **[`session`]** -- Bounded, fingerprint-bound in-memory sessions.
//! - **[`rate_limit`]** -- Sliding-window limiter with burst caps, cooldowns
//!   and a two-level (principal + aggregate) governor.
//! - **[`anomaly`]** -- Statistical detectors over audit windows.
//! - **[`containment`]** -- Per-principal threat state machine.
//! - **[`error`]** -- Unified error types via [`thiserror`].

pub mod anomaly;
pub mod containment;
pub mod decision;
pub mod error;
pub mod policy;
pub mod rate_limit;
pub mod session;

pub use anomaly::{Anomaly, AnomalyDetector, AnomalyKind, AnomalyThresholds};
pub use containment::{ContainmentRegistry, ContainmentState, ContainmentThresholds, ThreatLevel};
pub use decision::{
    AccessGrant, AccessRequest, Caller, Decision, DecisionEngine, DecisionOutcome, DenyReason,
    OperationCeilings,
};
pub use error::{AccessError, Result};
pub use policy::{AccessPolicy, AccessWindow, DecisionLevel, PolicySet, PolicyStore};
pub use rate_limit::{AggregateRateSettings, RateDecision, RateGovernor, RateLimitConfig, RateLimiter};
pub use session::{Session, SessionFailure, SessionManager, SessionSettings};
