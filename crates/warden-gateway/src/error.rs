//! Gateway error types.
//!
//! [`GatewayError`] is the caller-facing taxonomy. Vault and access errors
//! are folded into it so callers never need to match on lower-layer types.

use warden_access::{AccessError, DenyReason, SessionFailure};
use warden_vault::VaultError;

/// Unified error type for the Warden gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // -- Decision errors ----------------------------------------------------
    /// The decision engine denied the request.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: DenyReason },

    /// A rate budget is exhausted.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The session (or the grant derived from it) cannot be used.
    #[error("session invalid: {failure}")]
    SessionInvalid { failure: SessionFailure },

    // -- Crypto errors ------------------------------------------------------
    /// The key authority did not answer in time. Retryable.
    #[error("key unavailable: {key_id}")]
    KeyUnavailable { key_id: String },

    /// Decryption failed. Never carries a reason.
    #[error("decryption failed")]
    DecryptionFailed,

    /// The key cannot be used for this operation (deprecated/revoked/unknown).
    #[error("key rejected: {reason}")]
    KeyRejected { reason: String },

    // -- Integrity errors ---------------------------------------------------
    /// The audit chain failed verification; operator action required.
    #[error("audit integrity violation (first broken sequence: {sequence:?})")]
    IntegrityViolation { sequence: Option<u64> },

    // -- Store errors -------------------------------------------------------
    /// The secret store circuit breaker is open.
    #[error("resource unavailable, retry after {retry_after_secs}s")]
    ResourceUnavailable { retry_after_secs: u64 },

    #[error("secret not found: {id}")]
    SecretNotFound { id: String },

    #[error("secret already exists: {id}")]
    SecretAlreadyExists { id: String },

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    /// The classifier could not classify the payload.
    #[error("payload refused: {reason}")]
    Unclassified { reason: String },

    // -- Configuration errors -----------------------------------------------
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // -- Underlying errors --------------------------------------------------
    #[error("vault error: {0}")]
    Vault(VaultError),

    #[error("access error: {0}")]
    Access(AccessError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyUnavailable { .. }
                | Self::RateLimited { .. }
                | Self::ResourceUnavailable { .. }
                | Self::VersionConflict { .. }
        )
    }

    /// Map a denial to the most specific error.
    pub fn from_denial(reason: &DenyReason) -> Self {
        match reason {
            DenyReason::RateLimited { retry_after_secs } => Self::RateLimited {
                retry_after_secs: *retry_after_secs,
            },
            DenyReason::SessionInvalid { failure } => Self::SessionInvalid { failure: *failure },
            other => Self::PolicyDenied {
                reason: other.clone(),
            },
        }
    }
}

impl From<VaultError> for GatewayError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::KeyUnavailable { key_id } => Self::KeyUnavailable { key_id },
            VaultError::DecryptionFailed => Self::DecryptionFailed,
            VaultError::KeyDeprecated { .. }
            | VaultError::KeyRevoked { .. }
            | VaultError::UnknownKey { .. } => Self::KeyRejected {
                reason: e.to_string(),
            },
            VaultError::IntegrityViolation { sequence } => Self::IntegrityViolation {
                sequence: Some(sequence),
            },
            VaultError::SecretNotFound { id } => Self::SecretNotFound { id },
            VaultError::SecretAlreadyExists { id } => Self::SecretAlreadyExists { id },
            VaultError::VersionConflict {
                id,
                expected,
                actual,
            } => Self::VersionConflict {
                id,
                expected,
                actual,
            },
            other => Self::Vault(other),
        }
    }
}

impl From<AccessError> for GatewayError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::SessionInvalid { reason } => Self::SessionInvalid { failure: reason },
            AccessError::Audit(v) => Self::from(v),
            other => Self::Access(other),
        }
    }
}

/// Convenience alias used throughout the gateway crate.
pub type Result<T> = std::result::Result<T, GatewayError>;
