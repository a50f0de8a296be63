//! The access decision engine.
//!
//! [`DecisionEngine::evaluate`] runs an ordered, short-circuiting check list
//! and appends exactly one audit event per evaluation, whatever the result:
//!
//! 0. principal not isolated (and, if restricted, not mutating)
//! 1. principal has a role
//! 2. secret type permitted
//! 3. operation permitted
//! 4. rate budget (consumed here, even if a later step denies)
//! 5. justification present if the role requires it
//! 6. tenant isolation, unless the role allows cross-tenant access
//! 7. session valid, and for credential/financial secrets inside the
//!    role's access window
//!
//! A grant carries the finest level permitted, never above what was asked
//! for, and expires at `min(now + role TTL, session expiry, now + operation
//! ceiling)`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_vault::audit::{AuditChain, AuditEvent, AuditKind, AuditOutcome, AuditRef, Severity};
use warden_vault::types::{Operation, SecretType, SensitivityTier};

use crate::containment::{ContainmentRegistry, ThreatLevel};
use crate::error::{AccessError, Result};
use crate::policy::{DecisionLevel, PolicyStore};
use crate::rate_limit::RateGovernor;
use crate::session::{SessionFailure, SessionManager};

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// Who is calling, as presented on every gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub principal: String,
    pub tenant: String,
    pub session_id: Option<String>,
    /// Raw binding material; hashed before comparison.
    pub binding: String,
}

impl Caller {
    pub fn new(principal: impl Into<String>, tenant: impl Into<String>, binding: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            tenant: tenant.into(),
            session_id: None,
            binding: binding.into(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Everything the engine needs to decide one operation on one secret.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub caller: Caller,
    pub secret_id: String,
    pub secret_type: SecretType,
    pub tier: SensitivityTier,
    pub labels: Vec<String>,
    pub secret_tenant: String,
    pub operation: Operation,
    /// Level asked for; mutations are raised to their required level.
    pub requested_level: DecisionLevel,
    pub justification: Option<String>,
}

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    Contained { level: ThreatLevel },
    NoRole,
    TypeNotPermitted,
    OperationNotPermitted,
    RateLimited { retry_after_secs: u64 },
    JustificationRequired,
    CrossTenantBlocked,
    SessionInvalid { failure: SessionFailure },
    OutsideAccessWindow,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contained { level } => write!(f, "principal contained ({level})"),
            Self::NoRole => f.write_str("no role"),
            Self::TypeNotPermitted => f.write_str("type not permitted"),
            Self::OperationNotPermitted => f.write_str("operation not permitted"),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited (retry after {retry_after_secs}s)")
            }
            Self::JustificationRequired => f.write_str("justification required"),
            Self::CrossTenantBlocked => f.write_str("cross-tenant blocked"),
            Self::SessionInvalid { failure } => write!(f, "session invalid ({failure})"),
            Self::OutsideAccessWindow => f.write_str("outside access window"),
        }
    }
}

/// An ephemeral, bounded permission to perform one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id: Uuid,
    pub level: DecisionLevel,
    pub principal: String,
    pub secret_id: String,
    pub operation: Operation,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    /// Hash of the audit event that recorded this grant.
    pub audit_ref: String,
}

impl AccessGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Granted { grant: AccessGrant },
    Denied { reason: DenyReason },
}

impl DecisionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    pub fn grant(&self) -> Option<&AccessGrant> {
        match self {
            Self::Granted { grant } => Some(grant),
            Self::Denied { .. } => None,
        }
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Denied { reason } => Some(reason),
            Self::Granted { .. } => None,
        }
    }
}

/// An outcome plus the audit event that recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    pub audit: AuditRef,
}

/// Per-operation grant lifetime ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationCeilings {
    pub read_secs: u64,
    pub write_secs: u64,
    pub delete_secs: u64,
}

impl Default for OperationCeilings {
    fn default() -> Self {
        Self {
            read_secs: 60,
            write_secs: 30,
            delete_secs: 15,
        }
    }
}

impl OperationCeilings {
    pub fn for_operation(&self, op: Operation) -> chrono::Duration {
        let secs = match op {
            Operation::Read => self.read_secs,
            Operation::Create | Operation::Update => self.write_secs,
            Operation::Delete | Operation::Rotate => self.delete_secs,
        };
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DecisionEngine {
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionManager>,
    rates: Arc<RateGovernor>,
    containment: Arc<ContainmentRegistry>,
    audit: Arc<AuditChain>,
    ceilings: OperationCeilings,
}

impl DecisionEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        sessions: Arc<SessionManager>,
        rates: Arc<RateGovernor>,
        containment: Arc<ContainmentRegistry>,
        audit: Arc<AuditChain>,
        ceilings: OperationCeilings,
    ) -> Self {
        Self {
            policies,
            sessions,
            rates,
            containment,
            audit,
            ceilings,
        }
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn evaluate(&self, request: &AccessRequest) -> Result<Decision> {
        self.evaluate_at(request, Utc::now())
    }

    /// Evaluate `request` at wall-clock `now`. Audit write failures are the
    /// only errors; denials come back as [`DecisionOutcome::Denied`].
    pub fn evaluate_at(&self, request: &AccessRequest, now: DateTime<Utc>) -> Result<Decision> {
        self.evaluate_with(request, now, Instant::now())
    }

    /// Like [`evaluate_at`](Self::evaluate_at) with the rate windows read at
    /// `rate_now` instead of the monotonic clock.
    pub fn evaluate_with(
        &self,
        request: &AccessRequest,
        now: DateTime<Utc>,
        rate_now: Instant,
    ) -> Result<Decision> {
        let outcome = match self.decide(request, now, rate_now)? {
            Ok(grant) => DecisionOutcome::Granted { grant },
            Err(reason) => DecisionOutcome::Denied { reason },
        };
        self.record(request, outcome, now)
    }

    /// The check list. The outer `Result` carries infrastructure failures,
    /// the inner one the verdict.
    fn decide(
        &self,
        req: &AccessRequest,
        now: DateTime<Utc>,
        rate_now: Instant,
    ) -> Result<std::result::Result<AccessGrant, DenyReason>> {
        let principal = req.caller.principal.as_str();

        // 0. containment
        let threat = self.containment.level(principal);
        if threat == ThreatLevel::Isolated
            || (threat == ThreatLevel::Restricted && req.operation.is_mutation())
        {
            return Ok(Err(DenyReason::Contained { level: threat }));
        }

        // 1. role
        let Some((_role, policy)) = self.policies.policy_for(principal) else {
            return Ok(Err(DenyReason::NoRole));
        };

        // 2. type
        if !policy.permits_type(req.secret_type) {
            return Ok(Err(DenyReason::TypeNotPermitted));
        }

        // 3. operation
        if !policy.permits_operation(req.operation) {
            return Ok(Err(DenyReason::OperationNotPermitted));
        }

        // 4. rate
        let rate = self
            .rates
            .check_at(principal, &req.secret_id, &policy.rate_config(), rate_now);
        if !rate.allowed {
            return Ok(Err(DenyReason::RateLimited {
                retry_after_secs: rate.retry_after_secs,
            }));
        }

        // 5. justification
        let justified = req
            .justification
            .as_deref()
            .is_some_and(|j| !j.trim().is_empty());
        if policy.requires_justification && !justified {
            return Ok(Err(DenyReason::JustificationRequired));
        }

        // 6. tenant isolation
        if req.caller.tenant != req.secret_tenant {
            if !policy.allow_cross_tenant {
                return Ok(Err(DenyReason::CrossTenantBlocked));
            }
            if policy.cross_tenant_requires_justification && !justified {
                return Ok(Err(DenyReason::JustificationRequired));
            }
        }

        // 7. session and access window
        let Some(session_id) = req.caller.session_id.as_deref() else {
            return Ok(Err(DenyReason::SessionInvalid {
                failure: SessionFailure::Unknown,
            }));
        };
        let session = match self.sessions.validate_at(session_id, &req.caller.binding, now) {
            Ok(s) => s,
            Err(AccessError::SessionInvalid { reason }) => {
                return Ok(Err(DenyReason::SessionInvalid { failure: reason }));
            }
            Err(e) => return Err(e),
        };
        if session.principal != principal {
            return Ok(Err(DenyReason::SessionInvalid {
                failure: SessionFailure::BindingMismatch,
            }));
        }
        if req.secret_type.is_critical()
            && let Some(window) = policy.access_window
            && !window.contains(now.hour())
        {
            return Ok(Err(DenyReason::OutsideAccessWindow));
        }

        // Level and expiry.
        let requested = if req.operation.is_mutation() {
            DecisionLevel::required_for(req.operation)
        } else {
            req.requested_level
        };
        let level = requested.min(policy.max_level).min(threat.level_cap());
        if level < DecisionLevel::required_for(req.operation) {
            return Ok(Err(DenyReason::OperationNotPermitted));
        }

        let role_ttl = chrono::Duration::from_std(policy.session_ttl())
            .map_err(|e| AccessError::Internal(format!("role ttl out of range: {e}")))?;
        let expires_at = (now + role_ttl)
            .min(session.expires_at)
            .min(now + self.ceilings.for_operation(req.operation));

        Ok(Ok(AccessGrant {
            id: Uuid::now_v7(),
            level,
            principal: principal.to_string(),
            secret_id: req.secret_id.clone(),
            operation: req.operation,
            session_id: session.id,
            expires_at,
            audit_ref: String::new(),
        }))
    }

    fn record(&self, req: &AccessRequest, outcome: DecisionOutcome, now: DateTime<Utc>) -> Result<Decision> {
        let (audit_outcome, severity, detail) = match &outcome {
            DecisionOutcome::Granted { grant } => (
                AuditOutcome::Granted,
                Severity::Info,
                format!("grant {} level {}", grant.id, grant.level),
            ),
            DecisionOutcome::Denied { reason } => {
                let severity = match reason {
                    DenyReason::Contained { .. } | DenyReason::SessionInvalid { .. } => Severity::Warning,
                    _ => Severity::Info,
                };
                (AuditOutcome::Denied, severity, reason.to_string())
            }
        };

        let event = AuditEvent::new(AuditKind::AccessDecision, req.caller.principal.clone(), audit_outcome)
            .with_severity(severity)
            .with_target(req.secret_id.clone())
            .with_operation(req.operation)
            .with_justification(req.justification.as_deref())
            .with_classification(req.secret_type, req.tier, &req.labels)
            .with_detail(detail)
            .at(now);
        let audit = self.audit.append(event)?;

        let outcome = match outcome {
            DecisionOutcome::Granted { mut grant } => {
                grant.audit_ref = audit.hash.clone();
                tracing::debug!(
                    principal = %req.caller.principal,
                    secret = %req.secret_id,
                    operation = %req.operation,
                    level = %grant.level,
                    "access granted"
                );
                DecisionOutcome::Granted { grant }
            }
            DecisionOutcome::Denied { reason } => {
                tracing::warn!(
                    principal = %req.caller.principal,
                    secret = %req.secret_id,
                    operation = %req.operation,
                    reason = %reason,
                    "access denied"
                );
                DecisionOutcome::Denied { reason }
            }
        };

        Ok(Decision { outcome, audit })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::containment::ContainmentThresholds;
    use crate::rate_limit::RateLimitConfig;
    use crate::session::SessionSettings;

    const POLICIES: &str = r#"
        [roles.ops]
        allowed_types = ["token"]
        allowed_operations = ["read"]
        max_per_minute = 10

        [roles.lead]
        allowed_types = ["credential", "pii", "token"]
        allowed_operations = ["create", "read", "update", "delete", "rotate"]
        max_level = "delete"
        session_ttl_secs = 600

        [roles.auditor]
        allowed_types = ["credential"]
        allowed_operations = ["read"]
        max_level = "masked"
        requires_justification = true
        access_window = { start_hour = 8, end_hour = 18 }

        [roles.broker]
        allowed_types = ["token"]
        allowed_operations = ["read"]
        allow_cross_tenant = true

        [assignments]
        agent-7 = "ops"
        lead-1 = "lead"
        aud-1 = "auditor"
        broker-1 = "broker"
    "#;

    struct Fixture {
        audit: Arc<AuditChain>,
        sessions: Arc<SessionManager>,
        containment: Arc<ContainmentRegistry>,
        engine: DecisionEngine,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(AuditChain::in_memory());
        let sessions = Arc::new(SessionManager::new(SessionSettings::default(), audit.clone()));
        let containment = Arc::new(ContainmentRegistry::new(
            ContainmentThresholds::default(),
            audit.clone(),
        ));
        let engine = DecisionEngine::new(
            Arc::new(PolicyStore::from_toml(POLICIES).unwrap()),
            sessions.clone(),
            Arc::new(RateGovernor::new(RateLimitConfig::default())),
            containment.clone(),
            audit.clone(),
            OperationCeilings::default(),
        );
        Fixture {
            audit,
            sessions,
            containment,
            engine,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn request(f: &Fixture, principal: &str, secret_type: SecretType, op: Operation, now: DateTime<Utc>) -> AccessRequest {
        let session = f
            .sessions
            .create_at(principal, "fp", Duration::from_secs(3600), now)
            .unwrap();
        AccessRequest {
            caller: Caller::new(principal, "acme", "fp").with_session(session.id),
            secret_id: "s1".into(),
            secret_type,
            tier: SensitivityTier::Restricted,
            labels: vec![],
            secret_tenant: "acme".into(),
            operation: op,
            requested_level: DecisionLevel::Read,
            justification: None,
        }
    }

    fn denied(d: &Decision) -> DenyReason {
        d.outcome.deny_reason().cloned().unwrap()
    }

    #[test]
    fn type_outside_policy_denied_with_one_audit_event() {
        let f = fixture();
        let req = request(&f, "agent-7", SecretType::Credential, Operation::Read, noon());
        let before = f.audit.len().unwrap();

        let d = f.engine.evaluate_at(&req, noon()).unwrap();
        assert_eq!(denied(&d), DenyReason::TypeNotPermitted);
        assert_eq!(f.audit.len().unwrap(), before + 1);
        assert_eq!(d.audit.sequence as usize, before + 1);
    }

    #[test]
    fn unknown_principal_has_no_role() {
        let f = fixture();
        let req = request(&f, "stranger", SecretType::Token, Operation::Read, noon());
        assert_eq!(denied(&f.engine.evaluate_at(&req, noon()).unwrap()), DenyReason::NoRole);
    }

    #[test]
    fn operation_outside_policy_denied() {
        let f = fixture();
        let req = request(&f, "agent-7", SecretType::Token, Operation::Delete, noon());
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::OperationNotPermitted
        );
    }

    #[test]
    fn eleventh_request_rate_limited() {
        let f = fixture();
        let req = request(&f, "agent-7", SecretType::Token, Operation::Read, noon());

        for _ in 0..10 {
            assert!(f.engine.evaluate_at(&req, noon()).unwrap().outcome.is_granted());
        }
        match denied(&f.engine.evaluate_at(&req, noon()).unwrap()) {
            DenyReason::RateLimited { retry_after_secs } => {
                assert!((1..=60).contains(&retry_after_secs));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn rate_window_reopens_after_it_elapses() {
        let f = fixture();
        let req = request(&f, "agent-7", SecretType::Token, Operation::Read, noon());
        let start = Instant::now();

        for i in 0..10 {
            let at = start + Duration::from_secs(i);
            let d = f.engine.evaluate_with(&req, noon(), at).unwrap();
            assert!(d.outcome.is_granted(), "request {i} should pass");
        }

        let blocked = f
            .engine
            .evaluate_with(&req, noon(), start + Duration::from_secs(30))
            .unwrap();
        match denied(&blocked) {
            DenyReason::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 30),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // Every admitted hit is now older than the window.
        let later = start + Duration::from_secs(71);
        let d = f.engine.evaluate_with(&req, noon(), later).unwrap();
        assert!(d.outcome.is_granted());
    }

    #[test]
    fn grant_level_never_exceeds_request_or_ceiling() {
        let f = fixture();
        let mut req = request(&f, "lead-1", SecretType::Credential, Operation::Read, noon());
        req.requested_level = DecisionLevel::MetadataOnly;
        let d = f.engine.evaluate_at(&req, noon()).unwrap();
        assert_eq!(d.outcome.grant().unwrap().level, DecisionLevel::MetadataOnly);

        let mut req = request(&f, "aud-1", SecretType::Credential, Operation::Read, noon());
        req.justification = Some("quarterly review".into());
        let d = f.engine.evaluate_at(&req, noon()).unwrap();
        assert_eq!(d.outcome.grant().unwrap().level, DecisionLevel::Masked);
    }

    #[test]
    fn grant_expiry_is_minimum_of_bounds() {
        let f = fixture();
        let req = request(&f, "lead-1", SecretType::Credential, Operation::Delete, noon());
        let d = f.engine.evaluate_at(&req, noon()).unwrap();
        let grant = d.outcome.grant().unwrap();
        assert_eq!(grant.level, DecisionLevel::Delete);
        assert_eq!(grant.expires_at, noon() + chrono::Duration::seconds(15));
        assert_eq!(grant.audit_ref, d.audit.hash);
    }

    #[test]
    fn justification_and_access_window() {
        let f = fixture();
        let req = request(&f, "aud-1", SecretType::Credential, Operation::Read, noon());
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::JustificationRequired
        );

        let night = Utc.with_ymd_and_hms(2026, 3, 2, 23, 0, 0).unwrap();
        let mut req = request(&f, "aud-1", SecretType::Credential, Operation::Read, night);
        req.justification = Some("incident 42".into());
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, night).unwrap()),
            DenyReason::OutsideAccessWindow
        );
    }

    #[test]
    fn cross_tenant_rules() {
        let f = fixture();
        let mut req = request(&f, "agent-7", SecretType::Token, Operation::Read, noon());
        req.secret_tenant = "globex".into();
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::CrossTenantBlocked
        );

        let mut req = request(&f, "broker-1", SecretType::Token, Operation::Read, noon());
        req.secret_tenant = "globex".into();
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::JustificationRequired
        );
        req.justification = Some("tenant migration".into());
        assert!(f.engine.evaluate_at(&req, noon()).unwrap().outcome.is_granted());
    }

    #[test]
    fn missing_or_foreign_session_denied() {
        let f = fixture();
        let mut req = request(&f, "lead-1", SecretType::Token, Operation::Read, noon());
        req.caller.session_id = None;
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::SessionInvalid { failure: SessionFailure::Unknown }
        );

        let mut req = request(&f, "lead-1", SecretType::Token, Operation::Read, noon());
        req.caller.binding = "other-fp".into();
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::SessionInvalid { failure: SessionFailure::BindingMismatch }
        );
    }

    #[test]
    fn containment_restricts_then_isolates() {
        let f = fixture();
        f.containment.escalate("lead-1", 0.8, "test").unwrap();

        let req = request(&f, "lead-1", SecretType::Credential, Operation::Read, noon());
        let d = f.engine.evaluate_at(&req, noon()).unwrap();
        assert_eq!(d.outcome.grant().unwrap().level, DecisionLevel::MetadataOnly);

        let req = request(&f, "lead-1", SecretType::Credential, Operation::Update, noon());
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::Contained { level: ThreatLevel::Restricted }
        );

        f.containment.isolate("lead-1", "test").unwrap();
        let req = request(&f, "lead-1", SecretType::Credential, Operation::Read, noon());
        assert_eq!(
            denied(&f.engine.evaluate_at(&req, noon()).unwrap()),
            DenyReason::Contained { level: ThreatLevel::Isolated }
        );
    }
}
