//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, config resolution, store opening and
//! the static policy check.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use warden_access::{DecisionLevel, PolicyStore};
use warden_gateway::WardenConfig;
use warden_vault::audit::{AuditChain, AuditEvent, AuditMirror, JsonlMirror, SqliteAuditSink};
use warden_vault::keychain::{FileKeychain, load_or_init_master_key};
use warden_vault::keys::LocalKeyAuthority;
use warden_vault::types::{Operation, SecretType};

use crate::cli::Cli;

const DEFAULT_CONFIG: &str = "warden.toml";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Resolve the config file: `--config`, then `WARDEN_CONFIG`, then
/// `warden.toml` in the working directory.
pub fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| env_path("WARDEN_CONFIG"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

/// Load the config and apply the data directory override
/// (`--data-dir`, then `WARDEN_DATA_DIR`).
pub fn load_config(cli: &Cli) -> Result<WardenConfig> {
    let path = config_path(cli);
    let mut config = WardenConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(dir) = cli.data_dir.clone().or_else(|| env_path("WARDEN_DATA_DIR")) {
        config = config.with_data_dir(dir);
    }
    Ok(config)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Load (or create) the master key and build a key authority with the
/// configured default key registered.
pub fn key_authority(config: &WardenConfig) -> Result<Arc<LocalKeyAuthority>> {
    let keychain = FileKeychain::new(FileKeychain::default_path(&config.data_dir));
    let master = load_or_init_master_key(&keychain).context("failed to load master key")?;
    let authority = LocalKeyAuthority::new(&master).context("invalid master key")?;
    authority.register(&config.crypto.default_key_id);
    Ok(Arc::new(authority))
}

/// Open the on-disk audit chain (and its mirror, if configured).
pub fn open_audit(config: &WardenConfig) -> Result<AuditChain> {
    let db = config.audit_path();
    if !db.exists() {
        anyhow::bail!("no audit log at {} (run `warden init`)", db.display());
    }
    let sink = SqliteAuditSink::open(&db)
        .with_context(|| format!("failed to open audit log {}", db.display()))?;
    let mirror = match config.mirror_path() {
        Some(path) => Some(Box::new(JsonlMirror::open(path)?) as Box<dyn AuditMirror>),
        None => None,
    };
    AuditChain::open(Box::new(sink), mirror).context("failed to open audit chain")
}

/// One-line human rendering of an audit event.
pub fn format_event(event: &AuditEvent) -> String {
    let mut line = format!(
        "#{:<6} {} {:<8} {:<15} {:<9} {}",
        event.sequence,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.severity.as_str(),
        event.kind.as_str(),
        event.outcome.as_str(),
        event.principal,
    );
    if let Some(op) = event.operation {
        line.push_str(&format!(" {op}"));
    }
    if let Some(target) = &event.target {
        line.push_str(&format!(" {target}"));
    }
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" -- {detail}"));
    }
    line
}

// ---------------------------------------------------------------------------
// Static policy check
// ---------------------------------------------------------------------------

/// Result of checking a role against a type/operation pair without any
/// session, rate or containment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyCheck {
    pub principal: String,
    pub role: Option<String>,
    pub secret_type: SecretType,
    pub operation: Operation,
    pub permitted: bool,
    /// Finest level the role could ever receive for this operation.
    pub max_level: Option<DecisionLevel>,
    pub requires_justification: bool,
    pub problems: Vec<String>,
}

pub fn check_policy(
    policies: &PolicyStore,
    principal: &str,
    secret_type: &str,
    operation: &str,
) -> Result<PolicyCheck> {
    let secret_type = SecretType::parse(secret_type)
        .with_context(|| format!("unknown secret type '{secret_type}'"))?;
    let operation =
        Operation::parse(operation).with_context(|| format!("unknown operation '{operation}'"))?;

    let mut check = PolicyCheck {
        principal: principal.to_string(),
        role: None,
        secret_type,
        operation,
        permitted: false,
        max_level: None,
        requires_justification: false,
        problems: Vec::new(),
    };

    let Some((role, policy)) = policies.policy_for(principal) else {
        check.problems.push("no role assigned".to_string());
        return Ok(check);
    };
    check.role = Some(role.to_string());
    check.requires_justification = policy.requires_justification;

    if !policy.permits_type(secret_type) {
        check.problems.push(format!("type {secret_type} not permitted"));
    }
    if !policy.permits_operation(operation) {
        check.problems.push(format!("operation {operation} not permitted"));
    }
    let needed = DecisionLevel::required_for(operation);
    let level = if operation.is_mutation() {
        needed
    } else {
        policy.max_level
    };
    if policy.max_level < needed {
        check
            .problems
            .push(format!("max level {} below required {needed}", policy.max_level));
    } else {
        check.max_level = Some(level.min(policy.max_level));
    }

    check.permitted = check.problems.is_empty();
    if !check.permitted {
        check.max_level = None;
    }
    Ok(check)
}
