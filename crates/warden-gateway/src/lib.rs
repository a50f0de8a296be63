//! The Warden vault gateway.
//!
//! [`VaultGateway`] is the single façade through which secrets are created,
//! read, updated, deleted and rotated. It composes the vault core
//! (`warden-vault`) with access control (`warden-access`) and adds the
//! operational pieces around them:
//!
//! - **[`config`]** -- [`WardenConfig`], loaded from TOML or JSON.
//! - **[`classifier`]** -- payload classification; unclassified is refused.
//! - **[`breaker`]** -- circuit breaker around the secret store.
//! - **[`lock`]** -- per-(principal, secret) serialization.
//! - **[`redact`]** -- masking for reduced-fidelity reads.
//! - **[`gateway`]** -- the façade itself, returning structured [`Outcome`]s.
//! - **[`monitor`]** -- background reaper and anomaly scan.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_access::{AccessPolicy, Caller, DecisionLevel};
//! use warden_gateway::{VaultGateway, WardenConfig};
//! use warden_vault::keys::LocalKeyAuthority;
//! use warden_vault::types::{Operation, SecretType};
//!
//! # async fn example() -> warden_gateway::Result<()> {
//! let authority = Arc::new(LocalKeyAuthority::new(&[0u8; 32])?);
//! authority.register("kek-1");
//!
//! let config = WardenConfig::default()
//!     .with_role("lead", AccessPolicy {
//!         allowed_types: vec![SecretType::Credential],
//!         allowed_operations: vec![Operation::Create, Operation::Read],
//!         max_level: DecisionLevel::Write,
//!         ..AccessPolicy::default()
//!     })
//!     .with_assignment("lead-1", "lead");
//! let gateway = VaultGateway::in_memory(config, authority)?;
//!
//! let session = gateway.open_session("lead-1", "client-cert")?.into_result()?;
//! let caller = Caller::new("lead-1", "acme", "client-cert").with_session(session.id);
//! gateway.create(&caller, "db-password", SecretType::Credential, b"s3cr3t", None).await?;
//! let view = gateway.read(&caller, "db-password", DecisionLevel::Read, None).await?;
//! assert!(view.is_ok());
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod monitor;
pub mod redact;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use classifier::{Classification, DataClassifier, StaticClassifier};
pub use config::{AnomalySettings, AuditSettings, ClassifierSettings, CryptoSettings, WardenConfig};
pub use error::{GatewayError, Result};
pub use gateway::{IntegrityHold, Outcome, ReapStats, SecretValue, SecretView, VaultGateway};
pub use lock::{KeyedLocks, LockKey};
pub use monitor::Monitor;
