//! Bounded-lifetime sessions bound to a caller fingerprint.
//!
//! Sessions live in memory only; a restart invalidates all of them. Each
//! session stores the SHA-256 of the binding material presented at creation
//! (e.g. TLS client cert hash plus agent instance id). Presenting different
//! material later revokes the session and raises a security event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_vault::audit::{AuditChain, AuditEvent, AuditKind, AuditOutcome, AuditRef, Severity};
use warden_vault::crypto;

use crate::error::{AccessError, Result};

/// Why a session could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFailure {
    Expired,
    BindingMismatch,
    Unknown,
}

impl SessionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BindingMismatch => "binding mismatch",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Concurrent sessions per principal; the oldest is evicted beyond this.
    pub max_per_principal: usize,
    /// Upper bound on any session TTL, whatever the role asks for.
    pub max_ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_per_principal: 5,
            max_ttl_secs: 3600,
        }
    }
}

/// An active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub principal: String,
    /// SHA-256 of the binding material.
    pub binding: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub access_count: u64,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Hash binding material into a fingerprint.
pub fn binding_fingerprint(material: &str) -> String {
    crypto::sha256_hex(material.as_bytes())
}

/// In-memory session registry.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    settings: SessionSettings,
    audit: Arc<AuditChain>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings, audit: Arc<AuditChain>) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
            audit,
        }
    }

    pub fn create(&self, principal: &str, binding: &str, ttl: Duration) -> Result<Session> {
        self.create_at(principal, binding, ttl, Utc::now())
    }

    /// Open a session for `principal` bound to `binding`.
    ///
    /// If the principal already holds `max_per_principal` sessions, the
    /// oldest is evicted first.
    pub fn create_at(
        &self,
        principal: &str,
        binding: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        self.open_at(principal, binding, ttl, now).map(|(session, _)| session)
    }

    /// Like [`create_at`](Self::create_at), also returning the audit receipt
    /// of the "opened" event.
    pub fn open_at(
        &self,
        principal: &str,
        binding: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(Session, AuditRef)> {
        let ttl = ttl.min(Duration::from_secs(self.settings.max_ttl_secs));
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AccessError::Internal(format!("session ttl out of range: {e}")))?;

        let mut existing = self.sessions_for(principal);
        existing.sort_by_key(|s| s.created_at);
        let excess = (existing.len() + 1).saturating_sub(self.settings.max_per_principal.max(1));
        for old in existing.into_iter().take(excess) {
            self.remove(&old.id, "evicted")?;
        }

        let session = Session {
            id: Uuid::now_v7().to_string(),
            principal: principal.to_string(),
            binding: binding_fingerprint(binding),
            created_at: now,
            expires_at: now + ttl,
            last_activity: now,
            access_count: 0,
        };
        self.sessions.insert(session.id.clone(), session.clone());

        let receipt = self.audit.append(
            AuditEvent::new(AuditKind::Session, principal, AuditOutcome::Succeeded)
                .with_target(session.id.clone())
                .with_detail("opened")
                .at(now),
        )?;
        tracing::info!(principal = principal, session_id = %session.id, "session opened");
        Ok((session, receipt))
    }

    pub fn validate(&self, id: &str, binding: &str) -> Result<Session> {
        self.validate_at(id, binding, Utc::now())
    }

    /// Check a session and record activity.
    ///
    /// # Errors
    ///
    /// [`AccessError::SessionInvalid`] with the failure reason. A binding
    /// mismatch revokes the session and appends a critical security event;
    /// an expired session is removed.
    pub fn validate_at(&self, id: &str, binding: &str, now: DateTime<Utc>) -> Result<Session> {
        let fingerprint = binding_fingerprint(binding);

        // Decide under the shard lock, act after releasing it.
        let verdict = match self.sessions.get_mut(id) {
            None => Err(SessionFailure::Unknown),
            Some(mut s) => {
                if s.is_expired_at(now) {
                    Err(SessionFailure::Expired)
                } else if s.binding != fingerprint {
                    Err(SessionFailure::BindingMismatch)
                } else {
                    s.last_activity = now;
                    s.access_count += 1;
                    Ok(s.clone())
                }
            }
        };

        match verdict {
            Ok(session) => Ok(session),
            Err(SessionFailure::BindingMismatch) => {
                if let Some((_, session)) = self.sessions.remove(id) {
                    tracing::warn!(
                        principal = %session.principal,
                        session_id = id,
                        "session binding mismatch, session revoked"
                    );
                    self.audit.append(
                        AuditEvent::new(AuditKind::Security, session.principal, AuditOutcome::Alert)
                            .with_severity(Severity::Critical)
                            .with_target(id)
                            .with_detail("binding mismatch; session revoked")
                            .at(now),
                    )?;
                }
                Err(AccessError::SessionInvalid {
                    reason: SessionFailure::BindingMismatch,
                })
            }
            Err(SessionFailure::Expired) => {
                self.sessions.remove(id);
                Err(AccessError::SessionInvalid {
                    reason: SessionFailure::Expired,
                })
            }
            Err(reason) => Err(AccessError::SessionInvalid { reason }),
        }
    }

    /// Revoke a session. Revoking an unknown or already-revoked session is a
    /// no-op and returns `false`.
    pub fn revoke(&self, id: &str) -> Result<bool> {
        self.remove(id, "revoked")
    }

    /// Revoke every session of `principal`. Returns the number revoked.
    pub fn revoke_all(&self, principal: &str) -> Result<usize> {
        let ids: Vec<String> = self.sessions_for(principal).into_iter().map(|s| s.id).collect();
        let mut revoked = 0;
        for id in ids {
            if self.remove(&id, "revoked")? {
                revoked += 1;
            }
        }
        if revoked > 0 {
            tracing::warn!(principal = principal, revoked, "all sessions revoked");
        }
        Ok(revoked)
    }

    /// Drop expired sessions. Returns the number removed.
    pub fn reap_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        let reaped = before - self.sessions.len();
        if reaped > 0 {
            tracing::debug!(reaped, "expired sessions reaped");
        }
        reaped
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn sessions_for(&self, principal: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.principal == principal)
            .map(|s| s.clone())
            .collect()
    }

    /// Principals holding at least one session, sorted.
    pub fn principals(&self) -> Vec<String> {
        let mut out: Vec<String> = self.sessions.iter().map(|s| s.principal.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remove(&self, id: &str, why: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(false);
        };
        self.audit.append(
            AuditEvent::new(AuditKind::Session, session.principal.clone(), AuditOutcome::Succeeded)
                .with_target(id)
                .with_detail(why),
        )?;
        tracing::info!(principal = %session.principal, session_id = id, reason = why, "session closed");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
