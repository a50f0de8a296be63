//! Gateway configuration.
//!
//! One [`WardenConfig`] describes a whole deployment: crypto defaults,
//! session bounds, the aggregate rate budget, circuit breaker, grant
//! ceilings, anomaly/containment thresholds, audit storage and the role
//! table. Every section has defaults, so an empty file is a valid config.
//!
//! ```toml
//! data_dir = "/var/lib/warden"
//!
//! [crypto]
//! default_key_id = "kek-1"
//!
//! [breaker]
//! failure_threshold = 5
//! open_secs = 30
//!
//! [roles.ops]
//! allowed_types = ["token"]
//! allowed_operations = ["read"]
//! max_per_minute = 10
//!
//! [assignments]
//! agent-7 = "ops"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_access::{
    AccessPolicy, AggregateRateSettings, AnomalyThresholds, ContainmentThresholds,
    OperationCeilings, PolicySet, SessionSettings,
};
use warden_vault::types::{SecretType, SensitivityTier};

use crate::breaker::BreakerSettings;
use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSettings {
    /// KEK used for new secrets and as the default rotation target.
    pub default_key_id: String,
    pub key_cache_ttl_secs: u64,
    pub key_fetch_timeout_ms: u64,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            default_key_id: "kek-1".to_string(),
            key_cache_ttl_secs: 300,
            key_fetch_timeout_ms: 2000,
        }
    }
}

impl CryptoSettings {
    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.key_fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySettings {
    pub thresholds: AnomalyThresholds,
    pub containment: ContainmentThresholds,
    /// How far back each scan looks.
    pub window_secs: u64,
    pub scan_interval_secs: u64,
    /// Decryption failures on one secret before escalation.
    pub decrypt_failure_limit: u32,
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            thresholds: AnomalyThresholds::default(),
            containment: ContainmentThresholds::default(),
            window_secs: 3600,
            scan_interval_secs: 60,
            decrypt_failure_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// SQLite audit database, relative to `data_dir`.
    pub db_file: String,
    /// Write-once JSONL mirror, relative to `data_dir`; `None` disables it.
    pub mirror_file: Option<String>,
    /// Interval of the session/rate/lock reaper.
    pub reap_interval_secs: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            db_file: "audit.db".to_string(),
            mirror_file: Some("audit.jsonl".to_string()),
            reap_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Tier assigned to each secret type. Types absent here are refused.
    pub tiers: BTreeMap<SecretType, SensitivityTier>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            (SecretType::Credential, SensitivityTier::Restricted),
            (SecretType::Financial, SensitivityTier::Restricted),
            (SecretType::Certificate, SensitivityTier::Restricted),
            (SecretType::Pii, SensitivityTier::Sensitive),
            (SecretType::Token, SensitivityTier::Sensitive),
        ]);
        Self { tiers }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub data_dir: PathBuf,
    pub secrets_file: String,
    pub crypto: CryptoSettings,
    pub sessions: SessionSettings,
    pub rate: AggregateRateSettings,
    pub breaker: BreakerSettings,
    pub grants: OperationCeilings,
    pub anomaly: AnomalySettings,
    pub audit: AuditSettings,
    pub classifier: ClassifierSettings,
    pub roles: BTreeMap<String, AccessPolicy>,
    pub assignments: BTreeMap<String, String>,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            secrets_file: "secrets.db".to_string(),
            crypto: CryptoSettings::default(),
            sessions: SessionSettings::default(),
            rate: AggregateRateSettings::default(),
            breaker: BreakerSettings::default(),
            grants: OperationCeilings::default(),
            anomaly: AnomalySettings::default(),
            audit: AuditSettings::default(),
            classifier: ClassifierSettings::default(),
            roles: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }
}

impl WardenConfig {
    /// Load from a TOML (or `.json`) file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = if path.extension().is_some_and(|e| e == "json") {
            let config: Self = serde_json::from_str(&content)?;
            config.validate()?;
            config
        } else {
            Self::from_toml(&content)?
        };
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero budgets and lifetimes.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(GatewayError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.crypto.default_key_id.is_empty() {
            return invalid("crypto.default_key_id must not be empty");
        }
        if self.crypto.key_cache_ttl_secs == 0 || self.crypto.key_fetch_timeout_ms == 0 {
            return invalid("crypto cache ttl and fetch timeout must be non-zero");
        }
        if self.sessions.max_per_principal == 0 || self.sessions.max_ttl_secs == 0 {
            return invalid("session limits must be non-zero");
        }
        if self.rate.max_requests == 0 || self.rate.window_secs == 0 {
            return invalid("aggregate rate budget must be non-zero");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.open_secs == 0 {
            return invalid("breaker threshold and open period must be non-zero");
        }
        if self.grants.read_secs == 0 || self.grants.write_secs == 0 || self.grants.delete_secs == 0 {
            return invalid("grant ceilings must be non-zero");
        }
        if self.anomaly.decrypt_failure_limit == 0 {
            return invalid("anomaly.decrypt_failure_limit must be non-zero");
        }
        Ok(())
    }

    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            roles: self.roles.clone(),
            assignments: self.assignments.clone(),
        }
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.data_dir.join(&self.secrets_file)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join(&self.audit.db_file)
    }

    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.audit.mirror_file.as_ref().map(|f| self.data_dir.join(f))
    }

    // -- Builder-style setters ----------------------------------------------

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>, policy: AccessPolicy) -> Self {
        self.roles.insert(role.into(), policy);
        self
    }

    pub fn with_assignment(mut self, principal: impl Into<String>, role: impl Into<String>) -> Self {
        self.assignments.insert(principal.into(), role.into());
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_grants(mut self, grants: OperationCeilings) -> Self {
        self.grants = grants;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.crypto.key_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.anomaly.decrypt_failure_limit, 3);
    }

    #[test]
    fn sections_and_roles_parse() {
        let config = WardenConfig::from_toml(
            r#"
            data_dir = "/tmp/warden"

            [breaker]
            failure_threshold = 2

            [classifier.tiers]
            token = "internal"

            [roles.ops]
            allowed_types = ["token"]
            max_per_minute = 10

            [assignments]
            agent-7 = "ops"
            "#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.open_secs, BreakerSettings::default().open_secs);
        assert_eq!(
            config.classifier.tiers.get(&SecretType::Token),
            Some(&SensitivityTier::Internal)
        );
        assert_eq!(config.roles["ops"].rate_limit, 10);
        assert_eq!(config.secrets_path(), PathBuf::from("/tmp/warden/secrets.db"));
    }

    #[test]
    fn zero_values_rejected() {
        let err = WardenConfig::from_toml("[breaker]\nfailure_threshold = 0").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig { .. }));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WardenConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn json_config_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.json");
        std::fs::write(&path, r#"{"crypto": {"default_key_id": "kek-9"}}"#).unwrap();
        let config = WardenConfig::load(&path).unwrap();
        assert_eq!(config.crypto.default_key_id, "kek-9");
    }
}
