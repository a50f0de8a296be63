//! Access-control error types.
//!
//! Policy denials are *not* errors: they come back as
//! [`DecisionOutcome::Denied`](crate::decision::DecisionOutcome). The
//! variants here cover configuration problems, session validation failures
//! surfaced to the engine, containment misuse and audit write failures.

use crate::session::SessionFailure;

/// Unified error type for the Warden access layer.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    // -- Policy errors ------------------------------------------------------
    /// A policy refers to a role that is not defined.
    #[error("unknown role: {role}")]
    UnknownRole { role: String },

    /// A policy failed validation.
    #[error("invalid policy for role {role}: {reason}")]
    InvalidPolicy { role: String, reason: String },

    /// The policy file could not be parsed.
    #[error("policy parse error: {0}")]
    PolicyParse(#[from] toml::de::Error),

    // -- Session errors -----------------------------------------------------
    /// The session is expired, unknown or presented with the wrong binding.
    #[error("session invalid: {reason}")]
    SessionInvalid { reason: SessionFailure },

    // -- Containment errors -------------------------------------------------
    /// Reinstatement needs a named human approver other than the principal.
    #[error("reinstatement of {principal} requires an independent approver")]
    ApprovalRequired { principal: String },

    /// The principal is not under containment.
    #[error("principal is not contained: {principal}")]
    NotContained { principal: String },

    // -- Underlying errors --------------------------------------------------
    /// Appending to the audit chain failed.
    #[error("audit error: {0}")]
    Audit(#[from] warden_vault::VaultError),

    /// I/O error while reading policy files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    #[error("internal access error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the access crate.
pub type Result<T> = std::result::Result<T, AccessError>;
