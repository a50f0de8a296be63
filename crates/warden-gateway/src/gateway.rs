//! The vault gateway: the only way in or out of the vault.
//!
//! Every call follows the same path:
//!
//! 1. refuse while an integrity hold is active, and refuse isolated,
//!    role-less or session-less callers before any lookup;
//! 2. serialize on the `(principal, secret)` pair;
//! 3. load the stored record and classify any new payload;
//! 4. ask the [`DecisionEngine`] (one audit event per evaluation);
//! 5. re-check grant and session liveness before any crypto, and again
//!    once the key material has been fetched;
//! 6. run the operation behind the store circuit breaker;
//! 7. append an operation event.
//!
//! A call returns `Err` only when the audit chain itself cannot be written.
//! Every other failure, including denials, comes back inside an
//! [`Outcome`] together with the audit reference that recorded it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use warden_access::{
    AccessError, AccessGrant, AccessRequest, Anomaly, AnomalyDetector, Caller,
    ContainmentRegistry, DecisionEngine, DecisionLevel, DecisionOutcome, DenyReason, PolicyStore,
    RateGovernor, Session, SessionFailure, SessionManager, ThreatLevel,
};
use warden_vault::audit::{
    AuditChain, AuditEvent, AuditKind, AuditMirror, AuditOutcome, AuditRef, ChainReport,
    JsonlMirror, Severity, SqliteAuditSink,
};
use warden_vault::envelope::EnvelopeEngine;
use warden_vault::keys::{KeyAuthority, KeyCache};
use warden_vault::store::{SecretMetadata, SecretRecord, SecretStore, SqliteSecretStore};
use warden_vault::types::{Operation, SecretType};
use warden_vault::VaultError;

use crate::breaker::CircuitBreaker;
use crate::classifier::{DataClassifier, StaticClassifier};
use crate::config::WardenConfig;
use crate::error::{GatewayError, Result};
use crate::lock::{lock_key, KeyedLocks};
use crate::redact;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Structured result of one gateway call.
#[derive(Debug)]
pub struct Outcome<T> {
    /// The access decision, if the call got as far as the decision engine.
    pub decision: Option<DecisionOutcome>,
    /// The last audit event this call appended.
    pub audit: AuditRef,
    pub result: std::result::Result<T, GatewayError>,
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&GatewayError> {
        self.result.as_ref().err()
    }

    pub fn grant(&self) -> Option<&AccessGrant> {
        self.decision.as_ref().and_then(DecisionOutcome::grant)
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// A secret's value at the fidelity the grant allows.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    Plaintext(Vec<u8>),
    Masked(String),
    Token(String),
}

impl SecretValue {
    pub fn plaintext(&self) -> Option<&[u8]> {
        match self {
            Self::Plaintext(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext(bytes) => write!(f, "Plaintext(<{} bytes redacted>)", bytes.len()),
            Self::Masked(s) => f.debug_tuple("Masked").field(s).finish(),
            Self::Token(t) => f.debug_tuple("Token").field(t).finish(),
        }
    }
}

/// What a read returns. `value` is `None` at metadata-only.
#[derive(Debug, Clone)]
pub struct SecretView {
    pub metadata: SecretMetadata,
    pub level: DecisionLevel,
    pub value: Option<SecretValue>,
}

/// Set by a failed integrity check; cleared by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityHold {
    pub first_broken: Option<u64>,
    pub since: DateTime<Utc>,
}

/// Counts from one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub sessions: usize,
    pub rate_windows: usize,
    pub locks: usize,
}

/// A request that passed the decision engine and the liveness re-check.
struct Admitted {
    request: AccessRequest,
    grant: AccessGrant,
    decision: DecisionOutcome,
}

/// Inner `Err` is an already-audited refusal to hand back to the caller.
type Admission<A, T> = std::result::Result<A, Outcome<T>>;

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct VaultGateway {
    config: WardenConfig,
    store: Arc<dyn SecretStore>,
    audit: Arc<AuditChain>,
    crypto: EnvelopeEngine,
    classifier: Arc<dyn DataClassifier>,
    policies: Arc<PolicyStore>,
    sessions: Arc<SessionManager>,
    rates: Arc<RateGovernor>,
    containment: Arc<ContainmentRegistry>,
    engine: DecisionEngine,
    detector: AnomalyDetector,
    breaker: CircuitBreaker,
    locks: KeyedLocks,
    decrypt_failures: DashMap<String, u32>,
    hold: Mutex<Option<IntegrityHold>>,
}

impl VaultGateway {
    /// Compose a gateway from its collaborators.
    pub fn new(
        config: WardenConfig,
        keys: KeyCache,
        store: Arc<dyn SecretStore>,
        audit: Arc<AuditChain>,
        classifier: Arc<dyn DataClassifier>,
    ) -> Result<Self> {
        config.validate()?;

        let policies = Arc::new(PolicyStore::new(config.policy_set())?);
        let sessions = Arc::new(SessionManager::new(config.sessions.clone(), audit.clone()));
        let rates = Arc::new(RateGovernor::new(config.rate.to_config()));
        let containment = Arc::new(ContainmentRegistry::new(
            config.anomaly.containment.clone(),
            audit.clone(),
        ));
        let engine = DecisionEngine::new(
            policies.clone(),
            sessions.clone(),
            rates.clone(),
            containment.clone(),
            audit.clone(),
            config.grants.clone(),
        );

        tracing::info!(
            roles = config.roles.len(),
            assignments = config.assignments.len(),
            default_key = %config.crypto.default_key_id,
            "vault gateway ready"
        );

        Ok(Self {
            detector: AnomalyDetector::new(config.anomaly.thresholds.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            crypto: EnvelopeEngine::new(keys),
            locks: KeyedLocks::new(),
            decrypt_failures: DashMap::new(),
            hold: Mutex::new(None),
            config,
            store,
            audit,
            classifier,
            policies,
            sessions,
            rates,
            containment,
            engine,
        })
    }

    /// Open SQLite-backed stores under `config.data_dir`.
    pub fn open(config: WardenConfig, authority: Arc<dyn KeyAuthority>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = SqliteSecretStore::open(config.secrets_path())?;
        let sink = SqliteAuditSink::open(config.audit_path())?;
        let mirror = match config.mirror_path() {
            Some(path) => Some(Box::new(JsonlMirror::open(path)?) as Box<dyn AuditMirror>),
            None => None,
        };
        let audit = AuditChain::open(Box::new(sink), mirror)?;

        tracing::info!(data_dir = %config.data_dir.display(), "vault stores opened");
        Self::assemble(config, authority, Arc::new(store), Arc::new(audit))
    }

    /// Fully in-memory gateway.
    pub fn in_memory(config: WardenConfig, authority: Arc<dyn KeyAuthority>) -> Result<Self> {
        let store = SqliteSecretStore::open_in_memory()?;
        Self::assemble(config, authority, Arc::new(store), Arc::new(AuditChain::in_memory()))
    }

    fn assemble(
        config: WardenConfig,
        authority: Arc<dyn KeyAuthority>,
        store: Arc<dyn SecretStore>,
        audit: Arc<AuditChain>,
    ) -> Result<Self> {
        let keys = KeyCache::with_settings(
            authority,
            config.crypto.key_cache_ttl(),
            config.crypto.key_fetch_timeout(),
        );
        let classifier = Arc::new(StaticClassifier::from_settings(&config.classifier));
        Self::new(config, keys, store, audit, classifier)
    }

    // -- Accessors ----------------------------------------------------------

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn containment(&self) -> &ContainmentRegistry {
        &self.containment
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn integrity_hold(&self) -> Option<IntegrityHold> {
        self.hold_guard().clone()
    }

    // -- Sessions -----------------------------------------------------------

    /// Open a session whose lifetime is the principal's role TTL.
    #[instrument(skip(self, binding))]
    pub fn open_session(&self, principal: &str, binding: &str) -> Result<Outcome<Session>> {
        let base = AuditEvent::new(AuditKind::Session, principal, AuditOutcome::Denied);
        if let Some(hold) = self.integrity_hold() {
            return self.refuse(base, None, hold_error(&hold));
        }

        let threat = self.containment.level(principal);
        if threat == ThreatLevel::Isolated {
            let reason = DenyReason::Contained { level: threat };
            return self.refuse(base, None, GatewayError::PolicyDenied { reason });
        }
        let Some((_, policy)) = self.policies.policy_for(principal) else {
            return self.refuse(
                base,
                None,
                GatewayError::PolicyDenied {
                    reason: DenyReason::NoRole,
                },
            );
        };

        let (session, audit) = self
            .sessions
            .open_at(principal, binding, policy.session_ttl(), Utc::now())?;
        Ok(Outcome {
            decision: None,
            audit,
            result: Ok(session),
        })
    }

    /// Close a session. Closing twice is the same as closing once.
    pub fn close_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.revoke(session_id)?)
    }

    // -- Secret operations --------------------------------------------------

    /// Classify, encrypt and store a new secret owned by the caller's tenant.
    #[instrument(skip(self, caller, payload, justification), fields(principal = %caller.principal))]
    pub async fn create(
        &self,
        caller: &Caller,
        secret_id: &str,
        secret_type: SecretType,
        payload: &[u8],
        justification: Option<&str>,
    ) -> Result<Outcome<SecretMetadata>> {
        let op = Operation::Create;
        if let Some(refused) = self.refuse_on_hold(caller, secret_id, op)? {
            return Ok(refused);
        }
        let Some(class) = self.classifier.classify(secret_type, payload) else {
            return self.refuse(
                op_event(caller, secret_id, op),
                None,
                GatewayError::Unclassified {
                    reason: format!("{secret_type} payload could not be classified"),
                },
            );
        };

        let _guard = self.locks.lock(lock_key(&caller.principal, secret_id)).await;
        let now = Utc::now();
        let request = AccessRequest {
            caller: caller.clone(),
            secret_id: secret_id.to_string(),
            secret_type,
            tier: class.tier,
            labels: class.labels,
            secret_tenant: caller.tenant.clone(),
            operation: op,
            requested_level: DecisionLevel::Write,
            justification: justification.map(str::to_string),
        };
        let admitted = match self.decide(request, now)? {
            Ok(a) => a,
            Err(refused) => return Ok(refused),
        };

        let key_id = self.config.crypto.default_key_id.clone();
        if let Some(refused) = self.fetch_keys(&admitted, &[key_id.as_str()]).await? {
            return Ok(refused);
        }
        let envelope = match self
            .crypto
            .encrypt(payload, &key_id, Some(secret_id.as_bytes()))
            .await
        {
            Ok(envelope) => envelope,
            Err(e) => return self.fail(&admitted, e.into()),
        };

        let req = &admitted.request;
        let record = SecretRecord {
            id: secret_id.to_string(),
            secret_type,
            owner_hash: SecretRecord::owner_hash_for(&caller.principal),
            tenant: caller.tenant.clone(),
            envelope,
            key_id: key_id.clone(),
            tier: req.tier,
            labels: req.labels.clone(),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            access_count: 0,
            version: 1,
            rotation_required: false,
        };
        if let Err(e) = self.breaker.call(|| self.store.insert(&record)) {
            return self.fail(&admitted, e);
        }

        self.succeed(admitted, record.metadata(), format!("created under {key_id}"))
    }

    /// Read a secret at `level` or the finest level the policy permits below it.
    #[instrument(skip(self, caller, justification), fields(principal = %caller.principal))]
    pub async fn read(
        &self,
        caller: &Caller,
        secret_id: &str,
        level: DecisionLevel,
        justification: Option<&str>,
    ) -> Result<Outcome<SecretView>> {
        let op = Operation::Read;
        let _guard = self.locks.lock(lock_key(&caller.principal, secret_id)).await;
        let record = match self.load(caller, secret_id, op)? {
            Ok(r) => r,
            Err(refused) => return Ok(refused),
        };
        let now = Utc::now();
        let request = request_for(caller, &record, op, level, justification);
        let admitted = match self.decide(request, now)? {
            Ok(a) => a,
            Err(refused) => return Ok(refused),
        };

        let level = admitted.grant.level;
        let value = if level <= DecisionLevel::MetadataOnly {
            None
        } else {
            if let Some(refused) = self.fetch_keys(&admitted, &[record.envelope.key_id.as_str()]).await? {
                return Ok(refused);
            }
            let plaintext = match self
                .crypto
                .decrypt(&record.envelope, Some(secret_id.as_bytes()))
                .await
            {
                Ok(p) => p,
                Err(VaultError::DecryptionFailed) => {
                    return self.decryption_failed(admitted, &record);
                }
                Err(e) => return self.fail(&admitted, e.into()),
            };
            self.decrypt_failures.remove(secret_id);
            match self.render(level, &record, plaintext).await {
                Ok(v) => Some(v),
                Err(e) => return self.fail(&admitted, e.into()),
            }
        };

        let mut metadata = record.metadata();
        match self.breaker.call(|| self.store.record_access(secret_id, now)) {
            Ok(()) => {
                metadata.access_count += 1;
                metadata.last_accessed_at = Some(now);
            }
            Err(e) => tracing::warn!(secret = secret_id, error = %e, "access counters not updated"),
        }

        let view = SecretView {
            metadata,
            level,
            value,
        };
        self.succeed(admitted, view, format!("read at {level}"))
    }

    /// Replace a secret's payload. `expected_version` must match the store.
    #[instrument(skip(self, caller, payload, justification), fields(principal = %caller.principal))]
    pub async fn update(
        &self,
        caller: &Caller,
        secret_id: &str,
        payload: &[u8],
        expected_version: u64,
        justification: Option<&str>,
    ) -> Result<Outcome<SecretMetadata>> {
        let op = Operation::Update;
        let _guard = self.locks.lock(lock_key(&caller.principal, secret_id)).await;
        let record = match self.load(caller, secret_id, op)? {
            Ok(r) => r,
            Err(refused) => return Ok(refused),
        };
        let Some(class) = self.classifier.classify(record.secret_type, payload) else {
            return self.refuse(
                op_event(caller, secret_id, op),
                None,
                GatewayError::Unclassified {
                    reason: format!("{} payload could not be classified", record.secret_type),
                },
            );
        };

        let now = Utc::now();
        let mut request = request_for(caller, &record, op, DecisionLevel::Write, justification);
        request.tier = request.tier.max(class.tier);
        request.labels = class.labels;
        let admitted = match self.decide(request, now)? {
            Ok(a) => a,
            Err(refused) => return Ok(refused),
        };

        let key_id = self.config.crypto.default_key_id.clone();
        if let Some(refused) = self.fetch_keys(&admitted, &[key_id.as_str()]).await? {
            return Ok(refused);
        }
        let envelope = match self
            .crypto
            .encrypt(payload, &key_id, Some(secret_id.as_bytes()))
            .await
        {
            Ok(envelope) => envelope,
            Err(e) => return self.fail(&admitted, e.into()),
        };

        let updated = SecretRecord {
            envelope,
            key_id,
            tier: admitted.request.tier,
            labels: admitted.request.labels.clone(),
            updated_at: now,
            ..record
        };
        let version = match self.breaker.call(|| self.store.update(&updated, expected_version)) {
            Ok(v) => v,
            Err(e) => return self.fail(&admitted, e),
        };

        let mut metadata = updated.metadata();
        metadata.version = version;
        self.succeed(admitted, metadata, format!("updated to version {version}"))
    }

    /// Remove a secret, optionally checking its version first.
    #[instrument(skip(self, caller, justification), fields(principal = %caller.principal))]
    pub async fn delete(
        &self,
        caller: &Caller,
        secret_id: &str,
        expected_version: Option<u64>,
        justification: Option<&str>,
    ) -> Result<Outcome<()>> {
        let op = Operation::Delete;
        let _guard = self.locks.lock(lock_key(&caller.principal, secret_id)).await;
        let record = match self.load(caller, secret_id, op)? {
            Ok(r) => r,
            Err(refused) => return Ok(refused),
        };
        let request = request_for(caller, &record, op, DecisionLevel::Delete, justification);
        let admitted = match self.decide(request, Utc::now())? {
            Ok(a) => a,
            Err(refused) => return Ok(refused),
        };

        if let Err(e) = self
            .breaker
            .call(|| self.store.delete(secret_id, expected_version))
        {
            return self.fail(&admitted, e);
        }
        self.decrypt_failures.remove(secret_id);

        self.succeed(admitted, (), "deleted".to_string())
    }

    /// Move a secret under `new_key_id` (the default key if `None`) and clear
    /// its mandatory-rotation flag.
    #[instrument(skip(self, caller, justification), fields(principal = %caller.principal))]
    pub async fn rotate(
        &self,
        caller: &Caller,
        secret_id: &str,
        new_key_id: Option<&str>,
        justification: Option<&str>,
    ) -> Result<Outcome<SecretMetadata>> {
        let op = Operation::Rotate;
        let _guard = self.locks.lock(lock_key(&caller.principal, secret_id)).await;
        let record = match self.load(caller, secret_id, op)? {
            Ok(r) => r,
            Err(refused) => return Ok(refused),
        };
        let now = Utc::now();
        let request = request_for(caller, &record, op, DecisionLevel::Delete, justification);
        let admitted = match self.decide(request, now)? {
            Ok(a) => a,
            Err(refused) => return Ok(refused),
        };

        let new_key_id = new_key_id
            .unwrap_or(&self.config.crypto.default_key_id)
            .to_string();
        let keys = [new_key_id.as_str(), record.envelope.key_id.as_str()];
        if let Some(refused) = self.fetch_keys(&admitted, &keys).await? {
            return Ok(refused);
        }
        let envelope = match self
            .crypto
            .rotate_key(&record.envelope, &new_key_id, Some(secret_id.as_bytes()))
            .await
        {
            Ok(envelope) => envelope,
            Err(VaultError::DecryptionFailed) => return self.decryption_failed(admitted, &record),
            Err(e) => return self.fail(&admitted, e.into()),
        };

        let old_key_id = record.key_id.clone();
        let expected_version = record.version;
        let rotated = SecretRecord {
            envelope,
            key_id: new_key_id.clone(),
            rotation_required: false,
            updated_at: now,
            ..record
        };
        let version = match self.breaker.call(|| self.store.update(&rotated, expected_version)) {
            Ok(v) => v,
            Err(e) => return self.fail(&admitted, e),
        };
        self.decrypt_failures.remove(secret_id);

        let mut metadata = rotated.metadata();
        metadata.version = version;
        self.succeed(admitted, metadata, format!("rotated {old_key_id} -> {new_key_id}"))
    }

    /// Pre-flight: run the decision for an operation on an existing secret
    /// without executing it.
    #[instrument(skip(self, caller, justification), fields(principal = %caller.principal))]
    pub fn check_access(
        &self,
        caller: &Caller,
        secret_id: &str,
        operation: Operation,
        level: DecisionLevel,
        justification: Option<&str>,
    ) -> Result<Outcome<AccessGrant>> {
        let record = match self.load(caller, secret_id, operation)? {
            Ok(r) => r,
            Err(refused) => return Ok(refused),
        };
        let request = request_for(caller, &record, operation, level, justification);
        let evaluated = self.engine.evaluate(&request)?;
        let result = match &evaluated.outcome {
            DecisionOutcome::Granted { grant } => Ok(grant.clone()),
            DecisionOutcome::Denied { reason } => Err(GatewayError::from_denial(reason)),
        };
        Ok(Outcome {
            decision: Some(evaluated.outcome),
            audit: evaluated.audit,
            result,
        })
    }

    /// Metadata of every secret in the caller's tenant whose type the
    /// caller's role may see.
    #[instrument(skip(self, caller), fields(principal = %caller.principal))]
    pub fn list_secrets(&self, caller: &Caller) -> Result<Outcome<Vec<SecretMetadata>>> {
        let base = AuditEvent::new(AuditKind::Operation, caller.principal.clone(), AuditOutcome::Denied)
            .with_target("*")
            .with_operation(Operation::Read);
        if let Some(hold) = self.integrity_hold() {
            return self.refuse(base, None, hold_error(&hold));
        }

        let threat = self.containment.level(&caller.principal);
        if threat == ThreatLevel::Isolated {
            let reason = DenyReason::Contained { level: threat };
            return self.refuse(base, None, GatewayError::PolicyDenied { reason });
        }
        let Some((_, policy)) = self.policies.policy_for(&caller.principal) else {
            let reason = DenyReason::NoRole;
            return self.refuse(base, None, GatewayError::PolicyDenied { reason });
        };
        if let Some(failure) = self.session_failure(caller)? {
            return self.refuse(base, None, GatewayError::SessionInvalid { failure });
        }

        let listed = match self.breaker.call(|| self.store.list(Some(&caller.tenant))) {
            Ok(all) => all,
            Err(e) => return self.refuse(base, None, e),
        };
        let visible: Vec<SecretMetadata> = listed
            .into_iter()
            .filter(|m| policy.permits_type(m.secret_type))
            .collect();

        let mut event = base.with_detail(format!("listed {} secrets", visible.len()));
        event.outcome = AuditOutcome::Succeeded;
        let audit = self.audit.append(event)?;
        Ok(Outcome {
            decision: None,
            audit,
            result: Ok(visible),
        })
    }

    // -- Integrity ----------------------------------------------------------

    /// Verify the audit chain. A broken chain places the gateway on hold,
    /// revokes every session and flags every secret named at or after the
    /// break for mandatory rotation.
    #[instrument(skip(self))]
    pub fn verify_integrity(&self) -> Result<ChainReport> {
        let report = self.audit.verify_report()?;
        if report.valid {
            return Ok(report);
        }

        {
            let mut hold = self.hold_guard();
            if hold.is_none() {
                *hold = Some(IntegrityHold {
                    first_broken: report.first_broken,
                    since: Utc::now(),
                });
            }
        }
        let mut revoked = 0;
        for principal in self.sessions.principals() {
            revoked += self.sessions.revoke_all(&principal)?;
        }
        let flagged = match report.first_broken {
            Some(sequence) => self.flag_exposed_secrets(sequence)?,
            None => 0,
        };
        tracing::error!(
            first_broken = ?report.first_broken,
            sessions_revoked = revoked,
            secrets_flagged = flagged,
            "integrity hold engaged"
        );
        Ok(report)
    }

    /// Mark every stored secret that appears as a target at or after
    /// `from` as requiring rotation. Targets that no longer exist are skipped.
    fn flag_exposed_secrets(&self, from: u64) -> Result<usize> {
        let targets: BTreeSet<String> = self
            .audit
            .events_from(from)?
            .into_iter()
            .filter_map(|e| e.target)
            .collect();

        let mut flagged = 0;
        for target in &targets {
            match self.breaker.call(|| self.store.set_rotation_required(target, true)) {
                Ok(()) => flagged += 1,
                Err(GatewayError::SecretNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(flagged)
    }

    /// Lift the integrity hold. Returns `false` if none was active.
    pub fn acknowledge_integrity(&self, operator: &str) -> Result<bool> {
        if operator.trim().is_empty() {
            return Err(AccessError::ApprovalRequired {
                principal: "system".to_string(),
            }
            .into());
        }
        let Some(hold) = self.hold_guard().take() else {
            return Ok(false);
        };

        self.audit.append(
            AuditEvent::new(AuditKind::Integrity, operator, AuditOutcome::Succeeded)
                .with_severity(Severity::Warning)
                .with_detail(format!(
                    "integrity hold (first broken {:?}) acknowledged",
                    hold.first_broken
                )),
        )?;
        tracing::warn!(operator = operator, "integrity hold lifted");
        Ok(true)
    }

    // -- Containment --------------------------------------------------------

    /// Human-approved return of a contained principal to normal.
    pub fn reinstate(&self, principal: &str, approver: &str) -> Result<ThreatLevel> {
        Ok(self.containment.reinstate(principal, approver)?)
    }

    /// Secrets flagged for mandatory rotation.
    pub fn rotation_queue(&self) -> Result<Vec<String>> {
        self.breaker.call(|| self.store.list_rotation_required())
    }

    /// Drop cached material for a key whose status changed.
    pub async fn invalidate_key(&self, key_id: &str) {
        self.crypto.key_cache().invalidate(key_id).await;
    }

    // -- Background work ----------------------------------------------------

    pub fn run_anomaly_scan(&self) -> Result<Vec<Anomaly>> {
        self.run_anomaly_scan_at(Utc::now())
    }

    /// Analyze the recent audit window and escalate containment.
    /// Principals pushed to isolation lose their sessions.
    pub fn run_anomaly_scan_at(&self, now: DateTime<Utc>) -> Result<Vec<Anomaly>> {
        let window = chrono::Duration::seconds(
            i64::try_from(self.config.anomaly.window_secs).unwrap_or(i64::MAX / 1000),
        );
        let mut events = self.audit.events_since(now - window)?;
        // Behaviour already reviewed by a reinstating human is not rescored.
        events.retain(|e| {
            self.containment
                .reinstated_at(&e.principal)
                .is_none_or(|watermark| e.sequence > watermark)
        });
        let anomalies = self.detector.analyze(&events);

        for anomaly in &anomalies {
            let raised = self.containment.escalate(
                &anomaly.principal,
                anomaly.confidence,
                anomaly.kind.name(),
            )?;
            if raised == Some(ThreatLevel::Isolated) {
                self.sessions.revoke_all(&anomaly.principal)?;
            }
        }
        if !anomalies.is_empty() {
            tracing::warn!(anomalies = anomalies.len(), "anomaly scan flagged principals");
        }
        Ok(anomalies)
    }

    pub fn reap(&self) -> ReapStats {
        self.reap_at(Utc::now())
    }

    /// Reclaim expired sessions, idle rate windows and unused locks.
    pub fn reap_at(&self, now: DateTime<Utc>) -> ReapStats {
        let stats = ReapStats {
            sessions: self.sessions.reap_expired_at(now),
            rate_windows: self.rates.prune_at(Instant::now()),
            locks: self.locks.prune(),
        };
        tracing::debug!(
            sessions = stats.sessions,
            rate_windows = stats.rate_windows,
            locks = stats.locks,
            "reaper pass"
        );
        stats
    }

    // -- Internal helpers ---------------------------------------------------

    fn hold_guard(&self) -> MutexGuard<'_, Option<IntegrityHold>> {
        self.hold.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refuse_on_hold<T>(
        &self,
        caller: &Caller,
        secret_id: &str,
        op: Operation,
    ) -> Result<Option<Outcome<T>>> {
        match self.integrity_hold() {
            Some(hold) => self
                .refuse(op_event(caller, secret_id, op), None, hold_error(&hold))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Caller checks, then the store lookup, all audited on failure.
    ///
    /// Hold, isolation, role and session are settled before the store is
    /// consulted. A record in a tenant the caller's role cannot reach is
    /// reported as missing.
    fn load<T>(&self, caller: &Caller, secret_id: &str, op: Operation) -> Result<Admission<SecretRecord, T>> {
        if let Some(refused) = self.refuse_on_hold(caller, secret_id, op)? {
            return Ok(Err(refused));
        }

        let base = op_event(caller, secret_id, op);
        let threat = self.containment.level(&caller.principal);
        if threat == ThreatLevel::Isolated {
            let reason = DenyReason::Contained { level: threat };
            return self.refuse(base, None, GatewayError::PolicyDenied { reason }).map(Err);
        }
        let Some((_, policy)) = self.policies.policy_for(&caller.principal) else {
            let reason = DenyReason::NoRole;
            return self.refuse(base, None, GatewayError::PolicyDenied { reason }).map(Err);
        };
        if let Some(failure) = self.session_failure(caller)? {
            return self.refuse(base, None, GatewayError::SessionInvalid { failure }).map(Err);
        }

        let record = match self.breaker.call(|| self.store.get(secret_id)) {
            Ok(record) => record,
            Err(e) => return self.refuse(base, None, e).map(Err),
        };
        if record.tenant != caller.tenant && !policy.allow_cross_tenant {
            let mut event = base
                .with_classification(record.secret_type, record.tier, &record.labels)
                .with_severity(Severity::Warning)
                .with_detail(DenyReason::CrossTenantBlocked.to_string());
            event.outcome = AuditOutcome::Denied;
            let audit = self.audit.append(event)?;
            tracing::warn!(
                principal = %caller.principal,
                target = secret_id,
                "cross-tenant lookup concealed"
            );
            return Ok(Err(Outcome {
                decision: None,
                audit,
                result: Err(GatewayError::SecretNotFound {
                    id: secret_id.to_string(),
                }),
            }));
        }
        Ok(Ok(record))
    }

    /// Resolve the key material a crypto step needs, then re-check that the
    /// grant and session outlived the fetch.
    async fn fetch_keys<T>(&self, admitted: &Admitted, key_ids: &[&str]) -> Result<Option<Outcome<T>>> {
        for key_id in key_ids {
            if let Err(e) = self.crypto.key_cache().get(key_id).await {
                return self.fail(admitted, e.into()).map(Some);
            }
        }
        match self.ensure_live(&admitted.grant, Utc::now()) {
            Ok(()) => Ok(None),
            Err(failure) => {
                tracing::warn!(
                    principal = %admitted.request.caller.principal,
                    target = %admitted.request.secret_id,
                    failure = ?failure,
                    "grant lapsed during key fetch"
                );
                self.fail(admitted, GatewayError::SessionInvalid { failure })
                    .map(Some)
            }
        }
    }

    /// Evaluate, then make sure the grant is still usable.
    fn decide<T>(&self, request: AccessRequest, now: DateTime<Utc>) -> Result<Admission<Admitted, T>> {
        let evaluated = self.engine.evaluate_at(&request, now)?;
        let grant = match &evaluated.outcome {
            DecisionOutcome::Granted { grant } => grant.clone(),
            DecisionOutcome::Denied { reason } => {
                return Ok(Err(Outcome {
                    result: Err(GatewayError::from_denial(reason)),
                    decision: Some(evaluated.outcome),
                    audit: evaluated.audit,
                }));
            }
        };

        if let Err(failure) = self.ensure_live(&grant, Utc::now()) {
            let event = op_event(&request.caller, &request.secret_id, request.operation)
                .with_classification(request.secret_type, request.tier, &request.labels);
            return self
                .refuse(
                    event,
                    Some(evaluated.outcome),
                    GatewayError::SessionInvalid { failure },
                )
                .map(Err);
        }

        Ok(Ok(Admitted {
            request,
            grant,
            decision: evaluated.outcome,
        }))
    }

    /// A grant is usable while it and its session are unexpired.
    fn ensure_live(&self, grant: &AccessGrant, now: DateTime<Utc>) -> std::result::Result<(), SessionFailure> {
        if grant.is_expired_at(now) {
            return Err(SessionFailure::Expired);
        }
        match self.sessions.get(&grant.session_id) {
            None => Err(SessionFailure::Unknown),
            Some(session) if session.is_expired_at(now) => Err(SessionFailure::Expired),
            Some(_) => Ok(()),
        }
    }

    fn session_failure(&self, caller: &Caller) -> Result<Option<SessionFailure>> {
        let Some(id) = caller.session_id.as_deref() else {
            return Ok(Some(SessionFailure::Unknown));
        };
        match self.sessions.validate(id, &caller.binding) {
            Ok(s) if s.principal == caller.principal => Ok(None),
            Ok(_) => Ok(Some(SessionFailure::BindingMismatch)),
            Err(AccessError::SessionInvalid { reason }) => Ok(Some(reason)),
            Err(e) => Err(e.into()),
        }
    }

    async fn render(
        &self,
        level: DecisionLevel,
        record: &SecretRecord,
        plaintext: Vec<u8>,
    ) -> warden_vault::Result<SecretValue> {
        Ok(match level {
            DecisionLevel::Tokenized => SecretValue::Token(
                self.crypto
                    .tokenize(&record.key_id, record.id.as_bytes(), &plaintext)
                    .await?,
            ),
            DecisionLevel::Masked => {
                SecretValue::Masked(redact::mask(&String::from_utf8_lossy(&plaintext)))
            }
            _ => SecretValue::Plaintext(plaintext),
        })
    }

    fn succeed<T>(&self, admitted: Admitted, value: T, detail: String) -> Result<Outcome<T>> {
        let req = &admitted.request;
        let mut event = op_event(&req.caller, &req.secret_id, req.operation);
        event.outcome = AuditOutcome::Succeeded;
        let audit = self.audit.append(
            event
                .with_justification(req.justification.as_deref())
                .with_classification(req.secret_type, req.tier, &req.labels)
                .with_detail(detail),
        )?;
        Ok(Outcome {
            decision: Some(admitted.decision),
            audit,
            result: Ok(value),
        })
    }

    fn fail<T>(&self, admitted: &Admitted, error: GatewayError) -> Result<Outcome<T>> {
        let req = &admitted.request;
        let event = op_event(&req.caller, &req.secret_id, req.operation)
            .with_classification(req.secret_type, req.tier, &req.labels);
        self.refuse(event, Some(admitted.decision.clone()), error)
    }

    /// Append `event` as a refusal or failure carrying `error`.
    fn refuse<T>(
        &self,
        mut event: AuditEvent,
        decision: Option<DecisionOutcome>,
        error: GatewayError,
    ) -> Result<Outcome<T>> {
        let (outcome, severity) = match &error {
            GatewayError::IntegrityViolation { .. } => (AuditOutcome::Denied, Severity::Critical),
            GatewayError::PolicyDenied { .. }
            | GatewayError::RateLimited { .. }
            | GatewayError::SessionInvalid { .. }
            | GatewayError::Unclassified { .. }
            | GatewayError::ResourceUnavailable { .. } => (AuditOutcome::Denied, Severity::Warning),
            _ => (AuditOutcome::Failed, Severity::Warning),
        };
        event.outcome = outcome;
        tracing::warn!(
            principal = %event.principal,
            target = ?event.target,
            error = %error,
            "gateway call refused"
        );

        let audit = self
            .audit
            .append(event.with_severity(severity).with_detail(error.to_string()))?;
        Ok(Outcome {
            decision,
            audit,
            result: Err(error),
        })
    }

    /// Audit a decryption failure; at the limit, isolate the principal,
    /// revoke their sessions and flag the secret for rotation.
    fn decryption_failed<T>(&self, admitted: Admitted, record: &SecretRecord) -> Result<Outcome<T>> {
        let limit = self.config.anomaly.decrypt_failure_limit;
        let count = {
            let mut entry = self.decrypt_failures.entry(record.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let req = &admitted.request;
        let principal = req.caller.principal.as_str();
        tracing::error!(principal = principal, secret = %record.id, failures = count, limit, "decryption failed");

        let audit = self.audit.append(
            AuditEvent::new(AuditKind::Security, principal, AuditOutcome::Failed)
                .with_severity(Severity::Critical)
                .with_target(record.id.clone())
                .with_operation(req.operation)
                .with_classification(record.secret_type, record.tier, &record.labels)
                .with_detail(format!("decryption failed ({count} of {limit})")),
        )?;

        if count >= limit {
            self.containment.isolate(principal, "repeated decryption failure")?;
            self.sessions.revoke_all(principal)?;
            if let Err(e) = self
                .breaker
                .call(|| self.store.set_rotation_required(&record.id, true))
            {
                tracing::error!(secret = %record.id, error = %e, "could not flag secret for rotation");
            }
            self.decrypt_failures.remove(&record.id);
        }

        Ok(Outcome {
            decision: Some(admitted.decision),
            audit,
            result: Err(GatewayError::DecryptionFailed),
        })
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn op_event(caller: &Caller, secret_id: &str, op: Operation) -> AuditEvent {
    AuditEvent::new(AuditKind::Operation, caller.principal.clone(), AuditOutcome::Failed)
        .with_target(secret_id)
        .with_operation(op)
}

fn request_for(
    caller: &Caller,
    record: &SecretRecord,
    operation: Operation,
    level: DecisionLevel,
    justification: Option<&str>,
) -> AccessRequest {
    AccessRequest {
        caller: caller.clone(),
        secret_id: record.id.clone(),
        secret_type: record.secret_type,
        tier: record.tier,
        labels: record.labels.clone(),
        secret_tenant: record.tenant.clone(),
        operation,
        requested_level: level,
        justification: justification.map(str::to_string),
    }
}

fn hold_error(hold: &IntegrityHold) -> GatewayError {
    GatewayError::IntegrityViolation {
        sequence: hold.first_broken,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
