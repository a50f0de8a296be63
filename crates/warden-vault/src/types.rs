//! Classification vocabulary shared by every Warden crate.
//!
//! These enums are stored as lowercase strings in SQLite and in audit
//! events, so `as_str`/`parse` must stay stable across releases.

use serde::{Deserialize, Serialize};

/// The kind of classified value a secret holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    /// Passwords, API keys, database credentials.
    Credential,
    /// Personally identifiable information.
    Pii,
    /// Card numbers, bank accounts, statements.
    Financial,
    /// Bearer/session tokens issued by third parties.
    Token,
    /// X.509 certificates and their private keys.
    Certificate,
}

impl SecretType {
    /// All secret types, in declaration order.
    pub const ALL: [SecretType; 5] = [
        Self::Credential,
        Self::Pii,
        Self::Financial,
        Self::Token,
        Self::Certificate,
    ];

    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Pii => "pii",
            Self::Financial => "financial",
            Self::Token => "token",
            Self::Certificate => "certificate",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential" => Some(Self::Credential),
            "pii" => Some(Self::Pii),
            "financial" => Some(Self::Financial),
            "token" => Some(Self::Token),
            "certificate" => Some(Self::Certificate),
            _ => None,
        }
    }

    /// The most sensitive categories, subject to access windows and
    /// off-hours monitoring.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Credential | Self::Financial)
    }
}

impl std::fmt::Display for SecretType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitivity tier assigned by the data classifier.
///
/// Ordered from least to most sensitive so that `tier > Sensitive` reads
/// naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityTier {
    Public = 0,
    Internal = 1,
    Sensitive = 2,
    Restricted = 3,
}

impl SensitivityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Sensitive => "sensitive",
            Self::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "sensitive" => Some(Self::Sensitive),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }

    /// Whether deterministic (equality-searchable) encryption may be used.
    ///
    /// This is a hard invariant of the envelope engine, not a policy knob.
    pub fn allows_deterministic(&self) -> bool {
        *self <= Self::Sensitive
    }
}

impl std::fmt::Display for SensitivityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation a principal may request on a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Rotate,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Delete,
        Self::Rotate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Rotate => "rotate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "read" => Some(Self::Read),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "rotate" => Some(Self::Rotate),
            _ => None,
        }
    }

    /// Whether the operation changes stored state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
