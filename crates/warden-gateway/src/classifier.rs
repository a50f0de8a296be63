//! Data classification seam.
//!
//! Every payload entering the vault is classified before anything else
//! happens. A payload the classifier cannot place is refused.

use std::collections::BTreeMap;

use warden_vault::types::{SecretType, SensitivityTier};

use crate::config::ClassifierSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: SensitivityTier,
    /// Field labels, used by co-access anomaly detection.
    pub labels: Vec<String>,
}

/// Assigns a sensitivity tier and labels to a payload.
pub trait DataClassifier: Send + Sync {
    /// `None` means unclassified.
    fn classify(&self, secret_type: SecretType, payload: &[u8]) -> Option<Classification>;
}

/// Classifier driven by a fixed type → tier table.
///
/// Labels are the keys of a JSON object payload, sorted; any other payload
/// is labelled with its type name.
#[derive(Debug, Clone)]
pub struct StaticClassifier {
    tiers: BTreeMap<SecretType, SensitivityTier>,
}

impl StaticClassifier {
    pub fn new(tiers: BTreeMap<SecretType, SensitivityTier>) -> Self {
        Self { tiers }
    }

    pub fn from_settings(settings: &ClassifierSettings) -> Self {
        Self::new(settings.tiers.clone())
    }
}

impl Default for StaticClassifier {
    fn default() -> Self {
        Self::from_settings(&ClassifierSettings::default())
    }
}

impl DataClassifier for StaticClassifier {
    fn classify(&self, secret_type: SecretType, payload: &[u8]) -> Option<Classification> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let tier = *self.tiers.get(&secret_type)?;

        let labels = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Object(map)) if !map.is_empty() => {
                let mut keys: Vec<String> = map.keys().cloned().collect();
                keys.sort();
                keys
            }
            _ => vec![secret_type.as_str().to_string()],
        };

        Some(Classification { tier, labels })
    }
}
