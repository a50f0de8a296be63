//! Vault core for Warden.
//!
//! This crate holds everything that touches key material or durable state:
//! envelope encryption over a key authority, the master-key keychain, the
//! secret store, and the tamper-evident audit chain. Access control lives in
//! `warden-access`; the composed façade lives in `warden-gateway`.
//!
//! # Modules
//!
//! - [`types`]: secret types, sensitivity tiers, operations.
//! - [`crypto`]: AES-256-GCM, HMAC-SHA256, SHA-256, PBKDF2 primitives.
//! - [`keys`]: key authority seam, local authority, TTL key cache.
//! - [`envelope`]: envelope encryption engine (randomized/deterministic).
//! - [`keychain`]: master key storage.
//! - [`store`]: SQLite secret store with optimistic versions.
//! - [`audit`]: hash-chained audit log with write-once mirror.
//! - [`error`]: unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_vault::keys::{KeyCache, LocalKeyAuthority};
//! use warden_vault::envelope::EnvelopeEngine;
//! use warden_vault::keychain::{load_or_init_master_key, MemoryKeychain};
//!
//! # async fn example() -> warden_vault::error::Result<()> {
//! let master = load_or_init_master_key(&MemoryKeychain::new())?;
//! let authority = Arc::new(LocalKeyAuthority::new(&master)?);
//! authority.register("kek-1");
//!
//! let engine = EnvelopeEngine::new(KeyCache::new(authority));
//! let envelope = engine.encrypt(b"s3cr3t", "kek-1", None).await?;
//! assert_eq!(engine.decrypt(&envelope, None).await?, b"s3cr3t");
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keychain;
pub mod keys;
pub mod store;
pub mod types;

pub use audit::{
    AuditChain, AuditEvent, AuditKind, AuditMirror, AuditOutcome, AuditRef, AuditSink,
    ChainReport, JsonlMirror, MemoryAuditSink, MemoryMirror, Severity, SqliteAuditSink,
};
pub use envelope::{EncryptionMode, Envelope, EnvelopeEngine};
pub use error::{Result, VaultError};
pub use keychain::{FileKeychain, KeychainProvider, MemoryKeychain};
pub use keys::{EncryptionKey, KeyAuthority, KeyCache, KeyMaterial, KeyStatus, LocalKeyAuthority};
pub use store::{SecretMetadata, SecretRecord, SecretStore, SqliteSecretStore};
pub use types::{Operation, SecretType, SensitivityTier};
