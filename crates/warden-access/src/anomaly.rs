//! Statistical anomaly detection over windows of audit events.
//!
//! The detector is stateless: feed it the events of a time window (usually
//! [`AuditChain::events_since`](warden_vault::audit::AuditChain::events_since))
//! and it returns zero or more [`Anomaly`] values, each with a confidence in
//! `[0, 1]`. Only granted access decisions are considered.
//!
//! Detectors:
//!
//! - **Volume outlier**: a principal's grant count sits far above the mean of
//!   the other principals (leave-one-out z-score).
//! - **Forbidden co-access**: one principal touched every label of a
//!   configured forbidden set (e.g. national id + birth date + address).
//! - **Off-hours access** to restricted-tier or credential/financial secrets.
//! - **Rapid escalation**: three or more strictly rising tiers within a short
//!   span.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use warden_vault::audit::{AuditEvent, AuditKind, AuditOutcome};
use warden_vault::types::SensitivityTier;

/// Tunable detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    /// z-score at which a principal's volume is an outlier.
    pub volume_z_score: f64,
    /// Minimum grants before a principal can be a volume outlier.
    pub volume_min_events: usize,
    /// Minimum other principals needed for a baseline.
    pub volume_min_population: usize,
    /// Off-hours span in UTC, `[start, end)`, wrapping past midnight.
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    /// Span within which rising tiers count as escalation.
    pub escalation_window_secs: i64,
    /// Label sets no single principal may hold together.
    pub forbidden_sets: Vec<Vec<String>>,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            volume_z_score: 3.0,
            volume_min_events: 10,
            volume_min_population: 3,
            off_hours_start: 22,
            off_hours_end: 6,
            escalation_window_secs: 300,
            forbidden_sets: vec![vec![
                "national_id".to_string(),
                "birth_date".to_string(),
                "address".to_string(),
            ]],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnomalyKind {
    VolumeOutlier { count: usize, baseline_mean: f64 },
    ForbiddenCoAccess { labels: Vec<String> },
    OffHoursAccess { events: usize },
    RapidEscalation { from: SensitivityTier, to: SensitivityTier },
}

impl AnomalyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VolumeOutlier { .. } => "volume_outlier",
            Self::ForbiddenCoAccess { .. } => "forbidden_co_access",
            Self::OffHoursAccess { .. } => "off_hours_access",
            Self::RapidEscalation { .. } => "rapid_escalation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub principal: String,
    pub kind: AnomalyKind,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    /// Analyze one window of events.
    pub fn analyze(&self, events: &[AuditEvent]) -> Vec<Anomaly> {
        let mut by_principal: BTreeMap<&str, Vec<&AuditEvent>> = BTreeMap::new();
        for e in events.iter().filter(|e| is_granted_access(e)) {
            by_principal.entry(e.principal.as_str()).or_default().push(e);
        }

        let now = Utc::now();
        let mut anomalies = Vec::new();
        anomalies.extend(self.volume_outliers(&by_principal, now));

        for (principal, grants) in &by_principal {
            let mut grants = grants.clone();
            grants.sort_by_key(|e| e.timestamp);

            if let Some(kind) = self.forbidden_co_access(&grants) {
                anomalies.push(anomaly(principal, kind, 0.8, now));
            }
            if let Some((kind, confidence)) = self.off_hours(&grants) {
                anomalies.push(anomaly(principal, kind, confidence, now));
            }
            if let Some(kind) = self.rapid_escalation(&grants) {
                anomalies.push(anomaly(principal, kind, 0.7, now));
            }
        }

        if !anomalies.is_empty() {
            tracing::debug!(count = anomalies.len(), events = events.len(), "anomalies detected");
        }
        anomalies
    }

    fn volume_outliers(
        &self,
        by_principal: &BTreeMap<&str, Vec<&AuditEvent>>,
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let t = &self.thresholds;
        if by_principal.len() < t.volume_min_population + 1 {
            return Vec::new();
        }

        let counts: Vec<(&str, f64)> = by_principal
            .iter()
            .map(|(p, e)| (*p, e.len() as f64))
            .collect();

        let mut out = Vec::new();
        for (i, (principal, count)) in counts.iter().enumerate() {
            if (*count as usize) < t.volume_min_events {
                continue;
            }
            let others: Vec<f64> = counts
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, (_, c))| *c)
                .collect();
            let n = others.len() as f64;
            let mean = others.iter().sum::<f64>() / n;
            let variance = others.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt().max(1.0);
            let z = (count - mean) / std;

            if z >= t.volume_z_score {
                let confidence = (0.6 + 0.05 * (z - t.volume_z_score)).min(0.95);
                out.push(anomaly(
                    principal,
                    AnomalyKind::VolumeOutlier {
                        count: *count as usize,
                        baseline_mean: mean,
                    },
                    confidence,
                    now,
                ));
            }
        }
        out
    }

    fn forbidden_co_access(&self, grants: &[&AuditEvent]) -> Option<AnomalyKind> {
        let seen: BTreeSet<&str> = grants
            .iter()
            .flat_map(|e| e.labels.iter().map(String::as_str))
            .collect();

        self.thresholds
            .forbidden_sets
            .iter()
            .find(|set| !set.is_empty() && set.iter().all(|l| seen.contains(l.as_str())))
            .map(|set| AnomalyKind::ForbiddenCoAccess { labels: set.clone() })
    }

    fn off_hours(&self, grants: &[&AuditEvent]) -> Option<(AnomalyKind, f64)> {
        let (start, end) = (self.thresholds.off_hours_start, self.thresholds.off_hours_end);
        let in_off_hours = |hour: u32| {
            if start <= end {
                hour >= start && hour < end
            } else {
                hour >= start || hour < end
            }
        };

        let hits = grants
            .iter()
            .filter(|e| {
                let sensitive = e.tier == Some(SensitivityTier::Restricted)
                    || e.secret_type.is_some_and(|t| t.is_critical());
                sensitive && in_off_hours(e.timestamp.hour())
            })
            .count();

        (hits > 0).then(|| {
            let confidence = (0.5 + 0.1 * (hits as f64 - 1.0)).min(0.85);
            (AnomalyKind::OffHoursAccess { events: hits }, confidence)
        })
    }

    fn rapid_escalation(&self, grants: &[&AuditEvent]) -> Option<AnomalyKind> {
        let window = chrono::Duration::seconds(self.thresholds.escalation_window_secs);
        let tiered: Vec<(DateTime<Utc>, SensitivityTier)> = grants
            .iter()
            .filter_map(|e| e.tier.map(|t| (e.timestamp, t)))
            .collect();

        for (i, &(start, first)) in tiered.iter().enumerate() {
            let mut current = first;
            let mut steps = 0;
            for &(ts, tier) in &tiered[i + 1..] {
                if ts - start > window {
                    break;
                }
                if tier > current {
                    current = tier;
                    steps += 1;
                }
            }
            if steps >= 2 {
                return Some(AnomalyKind::RapidEscalation { from: first, to: current });
            }
        }
        None
    }
}

fn is_granted_access(e: &AuditEvent) -> bool {
    e.kind == AuditKind::AccessDecision && e.outcome == AuditOutcome::Granted
}

fn anomaly(principal: &str, kind: AnomalyKind, confidence: f64, now: DateTime<Utc>) -> Anomaly {
    Anomaly {
        principal: principal.to_string(),
        kind,
        confidence,
        detected_at: now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
