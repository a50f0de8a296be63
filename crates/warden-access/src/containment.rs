//! Graduated per-principal containment.
//!
//! Each principal moves through `Normal -> Monitored -> Restricted ->
//! Isolated` as anomaly confidence rises. Automatic transitions only ever
//! escalate; stepping back down needs [`ContainmentRegistry::reinstate`]
//! with a named human approver. Every transition is audited.
//!
//! A reinstatement records the audit sequence it was written at. Anomaly
//! scans ignore a principal's events at or below that watermark, so the
//! behaviour that was already reviewed cannot re-contain them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use warden_vault::audit::{AuditChain, AuditEvent, AuditKind, AuditOutcome, Severity};

use crate::error::{AccessError, Result};
use crate::policy::DecisionLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Normal,
    Monitored,
    /// Capped at metadata-only; mutations refused.
    Restricted,
    /// Everything refused; sessions revoked.
    Isolated,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Monitored => "monitored",
            Self::Restricted => "restricted",
            Self::Isolated => "isolated",
        }
    }

    /// Highest decision level a principal at this threat level may receive.
    pub fn level_cap(&self) -> DecisionLevel {
        match self {
            Self::Normal | Self::Monitored => DecisionLevel::Delete,
            Self::Restricted => DecisionLevel::MetadataOnly,
            Self::Isolated => DecisionLevel::Deny,
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence thresholds that map anomalies to threat levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentThresholds {
    pub monitored: f64,
    pub restricted: f64,
    pub isolated: f64,
}

impl Default for ContainmentThresholds {
    fn default() -> Self {
        Self {
            monitored: 0.5,
            restricted: 0.75,
            isolated: 0.9,
        }
    }
}

impl ContainmentThresholds {
    pub fn level_for(&self, confidence: f64) -> ThreatLevel {
        if confidence >= self.isolated {
            ThreatLevel::Isolated
        } else if confidence >= self.restricted {
            ThreatLevel::Restricted
        } else if confidence >= self.monitored {
            ThreatLevel::Monitored
        } else {
            ThreatLevel::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainmentState {
    pub level: ThreatLevel,
    pub since: DateTime<Utc>,
    pub reason: String,
}

pub struct ContainmentRegistry {
    states: DashMap<String, ContainmentState>,
    /// Audit sequence of each principal's latest reinstatement.
    reinstated: DashMap<String, u64>,
    thresholds: ContainmentThresholds,
    audit: Arc<AuditChain>,
}

impl ContainmentRegistry {
    pub fn new(thresholds: ContainmentThresholds, audit: Arc<AuditChain>) -> Self {
        Self {
            states: DashMap::new(),
            reinstated: DashMap::new(),
            thresholds,
            audit,
        }
    }

    pub fn level(&self, principal: &str) -> ThreatLevel {
        self.states
            .get(principal)
            .map(|s| s.level)
            .unwrap_or(ThreatLevel::Normal)
    }

    pub fn state(&self, principal: &str) -> Option<ContainmentState> {
        self.states.get(principal).map(|s| s.clone())
    }

    /// Audit sequence of the principal's latest reinstatement, if any.
    pub fn reinstated_at(&self, principal: &str) -> Option<u64> {
        self.reinstated.get(principal).map(|s| *s)
    }

    /// Escalate according to an anomaly confidence.
    ///
    /// Returns the new level if the principal moved up, `None` otherwise.
    pub fn escalate(&self, principal: &str, confidence: f64, reason: &str) -> Result<Option<ThreatLevel>> {
        let target = self.thresholds.level_for(confidence);
        self.raise_to(principal, target, reason)
    }

    /// Jump straight to [`ThreatLevel::Isolated`].
    pub fn isolate(&self, principal: &str, reason: &str) -> Result<Option<ThreatLevel>> {
        self.raise_to(principal, ThreatLevel::Isolated, reason)
    }

    fn raise_to(&self, principal: &str, target: ThreatLevel, reason: &str) -> Result<Option<ThreatLevel>> {
        if target <= self.level(principal) {
            return Ok(None);
        }

        let previous = {
            let mut entry = self
                .states
                .entry(principal.to_string())
                .or_insert_with(|| ContainmentState {
                    level: ThreatLevel::Normal,
                    since: Utc::now(),
                    reason: String::new(),
                });
            if target <= entry.level {
                return Ok(None);
            }
            let previous = entry.level;
            *entry = ContainmentState {
                level: target,
                since: Utc::now(),
                reason: reason.to_string(),
            };
            previous
        };

        let severity = if target >= ThreatLevel::Restricted {
            Severity::Critical
        } else {
            Severity::Warning
        };
        self.audit.append(
            AuditEvent::new(AuditKind::Containment, principal, AuditOutcome::Alert)
                .with_severity(severity)
                .with_detail(format!("{previous} -> {target}: {reason}")),
        )?;
        tracing::warn!(principal = principal, from = %previous, to = %target, reason = reason, "principal contained");
        Ok(Some(target))
    }

    /// Return a principal to [`ThreatLevel::Normal`].
    ///
    /// # Errors
    ///
    /// - [`AccessError::ApprovalRequired`] if `approver` is empty or is the
    ///   principal itself.
    /// - [`AccessError::NotContained`] if the principal is already normal.
    pub fn reinstate(&self, principal: &str, approver: &str) -> Result<ThreatLevel> {
        if approver.trim().is_empty() || approver == principal {
            return Err(AccessError::ApprovalRequired {
                principal: principal.to_string(),
            });
        }

        let previous = match self.states.remove(principal) {
            Some((_, state)) if state.level > ThreatLevel::Normal => state.level,
            _ => {
                return Err(AccessError::NotContained {
                    principal: principal.to_string(),
                });
            }
        };

        let receipt = self.audit.append(
            AuditEvent::new(AuditKind::Containment, principal, AuditOutcome::Succeeded)
                .with_severity(Severity::Warning)
                .with_detail(format!("reinstated from {previous} by {approver}")),
        )?;
        self.reinstated.insert(principal.to_string(), receipt.sequence);
        tracing::info!(
            principal = principal,
            approver = approver,
            from = %previous,
            watermark = receipt.sequence,
            "principal reinstated"
        );
        Ok(previous)
    }

    /// All principals above `Normal`.
    pub fn contained(&self) -> Vec<(String, ContainmentState)> {
        let mut out: Vec<_> = self
            .states
            .iter()
            .filter(|e| e.level > ThreatLevel::Normal)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
