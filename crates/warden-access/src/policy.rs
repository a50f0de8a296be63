//! Static per-role access policies.
//!
//! A [`PolicyStore`] maps roles to [`AccessPolicy`] entries and principals to
//! roles. It is built once (from config or TOML) and read concurrently.
//!
//! ```toml
//! [roles.ops]
//! allowed_types = ["token"]
//! allowed_operations = ["read"]
//! max_per_minute = 10
//!
//! [assignments]
//! agent-7 = "ops"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_vault::types::{Operation, SecretType};

use crate::error::{AccessError, Result};
use crate::rate_limit::RateLimitConfig;

// ---------------------------------------------------------------------------
// Decision levels
// ---------------------------------------------------------------------------

/// How much of a secret a grant exposes, from nothing to destructive access.
///
/// Levels are totally ordered; a grant never exceeds the requested level nor
/// the policy ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLevel {
    Deny,
    MetadataOnly,
    Tokenized,
    Masked,
    Read,
    Write,
    Delete,
}

impl DecisionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::MetadataOnly => "metadata_only",
            Self::Tokenized => "tokenized",
            Self::Masked => "masked",
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deny" => Some(Self::Deny),
            "metadata_only" | "metadata-only" => Some(Self::MetadataOnly),
            "tokenized" => Some(Self::Tokenized),
            "masked" => Some(Self::Masked),
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Minimum level an operation needs to execute.
    pub fn required_for(op: Operation) -> Self {
        match op {
            Operation::Read => Self::MetadataOnly,
            Operation::Create | Operation::Update => Self::Write,
            Operation::Delete | Operation::Rotate => Self::Delete,
        }
    }
}

impl std::fmt::Display for DecisionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Access window
// ---------------------------------------------------------------------------

/// Allowed UTC hours `[start_hour, end_hour)` for the most sensitive types.
/// Wraps past midnight when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl AccessWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Capabilities of one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    pub allowed_types: Vec<SecretType>,
    pub allowed_operations: Vec<Operation>,
    /// Requests allowed per `rate_window_secs`.
    #[serde(alias = "max_per_minute")]
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    /// Optional short-window burst cap.
    pub burst_limit: Option<u32>,
    pub burst_window_secs: u64,
    /// Extra denial period after a limit is exceeded.
    pub cooldown_secs: u64,
    pub requires_justification: bool,
    pub allow_cross_tenant: bool,
    pub cross_tenant_requires_justification: bool,
    pub session_ttl_secs: u64,
    /// Highest decision level this role may ever be granted.
    pub max_level: DecisionLevel,
    /// Hours during which credential/financial secrets may be touched.
    pub access_window: Option<AccessWindow>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allowed_types: Vec::new(),
            allowed_operations: vec![Operation::Read],
            rate_limit: 60,
            rate_window_secs: 60,
            burst_limit: None,
            burst_window_secs: 1,
            cooldown_secs: 0,
            requires_justification: false,
            allow_cross_tenant: false,
            cross_tenant_requires_justification: true,
            session_ttl_secs: 900,
            max_level: DecisionLevel::Read,
            access_window: None,
        }
    }
}

impl AccessPolicy {
    pub fn permits_type(&self, secret_type: SecretType) -> bool {
        self.allowed_types.contains(&secret_type)
    }

    pub fn permits_operation(&self, op: Operation) -> bool {
        self.allowed_operations.contains(&op) && self.max_level >= DecisionLevel::required_for(op)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn rate_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit,
            window: Duration::from_secs(self.rate_window_secs),
            burst_limit: self.burst_limit,
            burst_window: Duration::from_secs(self.burst_window_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        let invalid = |reason: &str| AccessError::InvalidPolicy {
            role: role.to_string(),
            reason: reason.to_string(),
        };
        if self.rate_limit == 0 || self.rate_window_secs == 0 {
            return Err(invalid("rate budget must be non-zero"));
        }
        if self.burst_limit == Some(0) || self.burst_window_secs == 0 {
            return Err(invalid("burst budget must be non-zero"));
        }
        if self.session_ttl_secs == 0 {
            return Err(invalid("session_ttl_secs must be non-zero"));
        }
        if let Some(w) = self.access_window
            && (w.start_hour > 23 || w.end_hour > 24 || w.start_hour == w.end_hour)
        {
            return Err(invalid("access_window hours out of range"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Serialized form of a policy set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    pub roles: BTreeMap<String, AccessPolicy>,
    /// principal id -> role name
    pub assignments: BTreeMap<String, String>,
}

/// Role table plus principal assignments.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    set: PolicySet,
}

impl PolicyStore {
    /// Build a store, validating every role and assignment.
    pub fn new(set: PolicySet) -> Result<Self> {
        for (role, policy) in &set.roles {
            policy.validate(role)?;
        }
        for role in set.assignments.values() {
            if !set.roles.contains_key(role) {
                return Err(AccessError::UnknownRole { role: role.clone() });
            }
        }
        tracing::info!(
            roles = set.roles.len(),
            assignments = set.assignments.len(),
            "policy store loaded"
        );
        Ok(Self { set })
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        Self::new(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Role and policy assigned to `principal`.
    pub fn policy_for(&self, principal: &str) -> Option<(&str, &AccessPolicy)> {
        let role = self.set.assignments.get(principal)?;
        self.set.roles.get(role).map(|p| (role.as_str(), p))
    }

    pub fn role(&self, role: &str) -> Option<&AccessPolicy> {
        self.set.roles.get(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&String, &AccessPolicy)> {
        self.set.roles.iter()
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&String, &String)> {
        self.set.assignments.iter()
    }

    pub fn policy_set(&self) -> &PolicySet {
        &self.set
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
