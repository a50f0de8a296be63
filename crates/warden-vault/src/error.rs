//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.
//!
//! [`VaultError::DecryptionFailed`] deliberately carries no detail: callers
//! must not be able to tell a wrong key from a tampered tag.

use crate::types::SensitivityTier;

/// Unified error type for the Warden vault core.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed. Never carries a reason.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Deterministic encryption was requested for a tier that forbids it.
    #[error("deterministic encryption is forbidden for tier {tier}")]
    DeterministicForbidden { tier: SensitivityTier },

    /// Key derivation failed (e.g. CSPRNG failure while generating salt).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Key authority errors -----------------------------------------------
    /// The key authority could not be reached or timed out. Retryable.
    #[error("key unavailable: key_id={key_id}")]
    KeyUnavailable { key_id: String },

    /// The key id is not known to the key authority.
    #[error("unknown key: key_id={key_id}")]
    UnknownKey { key_id: String },

    /// The key is deprecated and may only be used for decryption.
    #[error("key deprecated: key_id={key_id}")]
    KeyDeprecated { key_id: String },

    /// The key has been revoked and may not be used at all.
    #[error("key revoked: key_id={key_id}")]
    KeyRevoked { key_id: String },

    // -- Keychain errors ----------------------------------------------------
    /// The master key could not be retrieved from the keychain.
    #[error("master key not found in keychain")]
    MasterKeyNotFound,

    // -- Store errors -------------------------------------------------------
    /// The requested secret does not exist.
    #[error("secret not found: id={id}")]
    SecretNotFound { id: String },

    /// A secret with this id already exists.
    #[error("secret already exists: id={id}")]
    SecretAlreadyExists { id: String },

    /// Optimistic concurrency check failed.
    #[error("version conflict on secret {id}: expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    /// Database schema migration failed.
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    // -- Audit errors -------------------------------------------------------
    /// The audit chain failed verification at the given sequence number.
    #[error("audit chain integrity violation at sequence {sequence}")]
    IntegrityViolation { sequence: u64 },

    /// Writing to the write-once audit mirror failed.
    #[error("audit mirror write failed: {reason}")]
    MirrorWriteFailed { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (keychain files, audit mirror).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyUnavailable { .. })
    }

    /// Whether the error indicates a fault in the backing store rather than
    /// a well-formed negative answer (missing row, version conflict).
    ///
    /// Only store faults count towards opening a circuit breaker.
    pub fn is_store_fault(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Io(_) | Self::MigrationFailed { .. } | Self::Internal(_)
        )
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
