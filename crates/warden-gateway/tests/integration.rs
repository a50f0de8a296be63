//! Integration tests for the warden-gateway crate.
//!
//! Every test drives the public [`VaultGateway`] API the way a caller
//! would: open a session, then create/read/update/delete/rotate secrets,
//! checking both the structured outcome and what landed in the audit chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_access::{
    Caller, DecisionLevel, DenyReason, OperationCeilings, SessionFailure, ThreatLevel,
};
use warden_gateway::{
    BreakerSettings, GatewayError, SecretValue, StaticClassifier, VaultGateway, WardenConfig,
};
use warden_vault::audit::{AuditChain, AuditKind, AuditOutcome, Severity};
use warden_vault::keys::{KeyAuthority, KeyCache, KeyMaterial, LocalKeyAuthority};
use warden_vault::store::{SecretMetadata, SecretRecord, SecretStore};
use warden_vault::types::{Operation, SecretType};
use warden_vault::VaultError;

const CONFIG: &str = r#"
[roles.ops]
allowed_types = ["token"]
allowed_operations = ["read"]
max_per_minute = 10

[roles.lead]
allowed_types = ["credential", "pii", "token"]
allowed_operations = ["create", "read", "update", "delete", "rotate"]
max_level = "delete"
session_ttl_secs = 600

[roles.analyst]
allowed_types = ["credential", "pii"]
allowed_operations = ["read"]
max_level = "masked"

[assignments]
agent-7 = "ops"
lead-1 = "lead"
analyst-1 = "analyst"
"#;

fn authority() -> Arc<LocalKeyAuthority> {
    let authority = Arc::new(LocalKeyAuthority::new(&[42u8; 32]).unwrap());
    authority.register("kek-1");
    authority.register("kek-2");
    authority
}

fn config() -> WardenConfig {
    WardenConfig::from_toml(CONFIG).unwrap()
}

fn gateway() -> VaultGateway {
    VaultGateway::in_memory(config(), authority()).unwrap()
}

fn login(gw: &VaultGateway, principal: &str, binding: &str) -> Caller {
    let session = gw
        .open_session(principal, binding)
        .unwrap()
        .into_result()
        .unwrap();
    Caller::new(principal, "acme", binding).with_session(session.id)
}

async fn seed(gw: &VaultGateway, lead: &Caller, id: &str, secret_type: SecretType, payload: &[u8]) {
    let out = gw.create(lead, id, secret_type, payload, None).await.unwrap();
    assert!(out.is_ok(), "create {id} failed: {:?}", out.error());
}

// ═══════════════════════════════════════════════════════════════════════
//  Policy denials
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ops_reading_a_credential_is_denied_with_exactly_one_event() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    let ops = login(&gw, "agent-7", "cert-ops");

    let before = gw.audit().len().unwrap();
    let out = gw.read(&ops, "db-pass", DecisionLevel::Read, None).await.unwrap();

    assert!(matches!(
        out.error(),
        Some(GatewayError::PolicyDenied {
            reason: DenyReason::TypeNotPermitted
        })
    ));
    assert_eq!(gw.audit().len().unwrap(), before + 1);

    let last = gw.audit().tail(1).unwrap().remove(0);
    assert_eq!(last.kind, AuditKind::AccessDecision);
    assert_eq!(last.outcome, AuditOutcome::Denied);
    assert_eq!(last.detail.as_deref(), Some("type not permitted"));
    assert_eq!(last.hash, out.audit.hash);
}

#[tokio::test]
async fn principal_without_role_cannot_open_a_session() {
    let gw = gateway();
    let out = gw.open_session("stranger", "fp").unwrap();
    assert!(matches!(
        out.error(),
        Some(GatewayError::PolicyDenied {
            reason: DenyReason::NoRole
        })
    ));
    assert!(gw.sessions().is_empty());
}

#[tokio::test]
async fn existence_is_hidden_from_callers_without_standing() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    // No role: existing and missing ids are refused the same way.
    let stranger = Caller::new("stranger", "acme", "fp");
    for id in ["db-pass", "ghost"] {
        let out = gw.read(&stranger, id, DecisionLevel::Read, None).await.unwrap();
        assert!(
            matches!(
                out.error(),
                Some(GatewayError::PolicyDenied {
                    reason: DenyReason::NoRole
                })
            ),
            "{id}: {:?}",
            out.error()
        );
        assert!(out.decision.is_none());
    }

    // Wrong tenant: a foreign record reads exactly like a missing one.
    let foreigner = Caller {
        tenant: "globex".into(),
        ..lead.clone()
    };
    for id in ["db-pass", "ghost"] {
        let out = gw.read(&foreigner, id, DecisionLevel::Read, None).await.unwrap();
        match out.error() {
            Some(GatewayError::SecretNotFound { id: reported }) => assert_eq!(reported, id),
            other => panic!("{id}: expected not found, got {other:?}"),
        }
        assert!(out.decision.is_none());
    }

    // The log still records what really happened.
    let concealed = gw
        .audit()
        .events_for("lead-1")
        .unwrap()
        .into_iter()
        .filter(|e| e.target.as_deref() == Some("db-pass") && e.outcome == AuditOutcome::Denied)
        .count();
    assert_eq!(concealed, 1);
    assert_eq!(gw.store().get("db-pass").unwrap().access_count, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Read fidelity
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn lead_reads_plaintext_and_metadata_only_reveals_nothing() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    let full = gw
        .read(&lead, "db-pass", DecisionLevel::Read, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(full.level, DecisionLevel::Read);
    assert_eq!(full.value.as_ref().and_then(SecretValue::plaintext), Some(&b"s3cr3t"[..]));
    assert_eq!(full.metadata.access_count, 1);

    let meta = gw
        .read(&lead, "db-pass", DecisionLevel::MetadataOnly, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(meta.level, DecisionLevel::MetadataOnly);
    assert!(meta.value.is_none());
    assert_eq!(meta.metadata.id, "db-pass");
    assert_eq!(meta.metadata.secret_type, SecretType::Credential);
}

#[tokio::test]
async fn analyst_gets_masked_and_tokenized_views() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "card", SecretType::Pii, b"4111111111111111").await;
    let analyst = login(&gw, "analyst-1", "cert-an");

    let masked = gw
        .read(&analyst, "card", DecisionLevel::Read, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(masked.level, DecisionLevel::Masked);
    assert_eq!(masked.value, Some(SecretValue::Masked("************1111".into())));

    let first = gw
        .read(&analyst, "card", DecisionLevel::Tokenized, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    let second = gw
        .read(&analyst, "card", DecisionLevel::Tokenized, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    match (&first.value, &second.value) {
        (Some(SecretValue::Token(a)), Some(SecretValue::Token(b))) => {
            assert!(a.starts_with("tok_"));
            assert_eq!(a, b);
        }
        other => panic!("expected tokens, got {other:?}"),
    }
}

#[tokio::test]
async fn preflight_check_grants_without_touching_the_secret() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    let analyst = login(&gw, "analyst-1", "cert-an");

    let grant = gw
        .check_access(&analyst, "db-pass", Operation::Read, DecisionLevel::Read, None)
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(grant.level, DecisionLevel::Masked);
    assert!(grant.expires_at <= Utc::now() + chrono::Duration::seconds(60));

    let denied = gw
        .check_access(&analyst, "db-pass", Operation::Delete, DecisionLevel::Delete, None)
        .unwrap();
    assert!(!denied.is_ok());
    assert_eq!(gw.store().get("db-pass").unwrap().access_count, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Rate limiting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn eleventh_read_within_a_minute_is_rate_limited() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "api-token", SecretType::Token, b"tkn-123").await;
    let ops = login(&gw, "agent-7", "cert-ops");

    for i in 0..10 {
        let out = gw.read(&ops, "api-token", DecisionLevel::Read, None).await.unwrap();
        assert!(out.is_ok(), "request {i} should pass: {:?}", out.error());
    }

    let out = gw.read(&ops, "api-token", DecisionLevel::Read, None).await.unwrap();
    match out.error() {
        Some(GatewayError::RateLimited { retry_after_secs }) => {
            assert!((1..=60).contains(retry_after_secs));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(out.error().is_some_and(GatewayError::is_retryable));
}

// ═══════════════════════════════════════════════════════════════════════
//  Sessions
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn binding_change_revokes_and_original_binding_stays_dead() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    let analyst = login(&gw, "analyst-1", "cert-A");

    let mut forged = analyst.clone();
    forged.binding = "cert-B".into();

    let out = gw.read(&forged, "db-pass", DecisionLevel::Masked, None).await.unwrap();
    assert!(matches!(
        out.error(),
        Some(GatewayError::SessionInvalid {
            failure: SessionFailure::BindingMismatch
        })
    ));

    let out = gw.read(&analyst, "db-pass", DecisionLevel::Masked, None).await.unwrap();
    assert!(matches!(
        out.error(),
        Some(GatewayError::SessionInvalid {
            failure: SessionFailure::Unknown
        })
    ));

    let alerts = gw
        .audit()
        .events_for("analyst-1")
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::Security && e.severity == Severity::Critical)
        .count();
    assert_eq!(alerts, 1);
}

#[tokio::test]
async fn closing_a_session_twice_is_the_same_as_once() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    let id = lead.session_id.clone().unwrap();

    assert!(gw.close_session(&id).unwrap());
    let after_first = gw.audit().len().unwrap();
    assert!(!gw.close_session(&id).unwrap());
    assert_eq!(gw.audit().len().unwrap(), after_first);
    assert!(gw.sessions().get(&id).is_none());
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle: update, rotate, delete, list
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn update_uses_optimistic_versions() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"v1").await;

    let stale = gw.update(&lead, "db-pass", b"v2", 7, None).await.unwrap();
    assert!(matches!(
        stale.error(),
        Some(GatewayError::VersionConflict {
            expected: 7,
            actual: 1,
            ..
        })
    ));

    let meta = gw
        .update(&lead, "db-pass", b"v2", 1, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(meta.version, 2);

    let view = gw
        .read(&lead, "db-pass", DecisionLevel::Read, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(view.value.as_ref().and_then(SecretValue::plaintext), Some(&b"v2"[..]));
}

#[tokio::test]
async fn rotation_moves_secret_to_new_key_and_still_decrypts() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    let meta = gw
        .rotate(&lead, "db-pass", Some("kek-2"), None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(meta.key_id, "kek-2");
    assert_eq!(meta.version, 2);

    let view = gw
        .read(&lead, "db-pass", DecisionLevel::Read, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(view.value.as_ref().and_then(SecretValue::plaintext), Some(&b"s3cr3t"[..]));
}

#[tokio::test]
async fn deleted_secret_reads_as_not_found() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    assert!(gw.delete(&lead, "db-pass", Some(1), None).await.unwrap().is_ok());

    let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();
    assert!(matches!(out.error(), Some(GatewayError::SecretNotFound { .. })));
    assert!(out.decision.is_none());

    let last = gw.audit().tail(1).unwrap().remove(0);
    assert_eq!(last.kind, AuditKind::Operation);
    assert_eq!(last.outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn listing_shows_only_permitted_types_in_own_tenant() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    seed(&gw, &lead, "api-token", SecretType::Token, b"tkn").await;

    let other_tenant = Caller {
        tenant: "globex".into(),
        ..lead.clone()
    };
    seed(&gw, &other_tenant, "other-token", SecretType::Token, b"tkn").await;

    let ops = login(&gw, "agent-7", "cert-ops");
    let listed = gw.list_secrets(&ops).unwrap().into_result().unwrap();
    let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["api-token"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Escalation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn repeated_decryption_failures_isolate_and_flag_rotation() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    let mut record = gw.store().get("db-pass").unwrap();
    let original = record.envelope.clone();
    record.envelope.ciphertext[0] ^= 0x01;
    gw.store().update(&record, record.version).unwrap();

    for _ in 0..3 {
        let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();
        assert!(matches!(out.error(), Some(GatewayError::DecryptionFailed)));
    }

    assert_eq!(gw.containment().level("lead-1"), ThreatLevel::Isolated);
    assert!(gw.sessions().sessions_for("lead-1").is_empty());
    assert_eq!(gw.rotation_queue().unwrap(), vec!["db-pass".to_string()]);

    let critical = gw
        .audit()
        .events_for("lead-1")
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::Security && e.severity == Severity::Critical)
        .count();
    assert_eq!(critical, 3);

    let refused = gw.open_session("lead-1", "cert-lead").unwrap();
    assert!(matches!(
        refused.error(),
        Some(GatewayError::PolicyDenied {
            reason: DenyReason::Contained { .. }
        })
    ));

    // Self-approval is refused.
    assert!(gw.reinstate("lead-1", "lead-1").is_err());
    gw.reinstate("lead-1", "security-lead").unwrap();

    // Repair the envelope out of band; rotation then clears the flag.
    let mut repaired = gw.store().get("db-pass").unwrap();
    assert!(repaired.rotation_required);
    repaired.envelope = original;
    gw.store().update(&repaired, repaired.version).unwrap();

    let lead = login(&gw, "lead-1", "cert-lead");
    assert!(gw.rotate(&lead, "db-pass", Some("kek-2"), None).await.unwrap().is_ok());
    assert!(gw.rotation_queue().unwrap().is_empty());
}

#[tokio::test]
async fn forbidden_co_access_restricts_to_metadata() {
    let gw = gateway();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "p1", SecretType::Pii, br#"{"national_id": "123-45-6789"}"#).await;
    seed(&gw, &lead, "p2", SecretType::Pii, br#"{"birth_date": "1990-01-01"}"#).await;
    seed(&gw, &lead, "p3", SecretType::Pii, br#"{"address": "1 Main St"}"#).await;
    let analyst = login(&gw, "analyst-1", "cert-an");

    for id in ["p1", "p2", "p3"] {
        let out = gw.read(&analyst, id, DecisionLevel::Masked, None).await.unwrap();
        assert!(out.is_ok());
    }

    let anomalies = gw.run_anomaly_scan().unwrap();
    assert!(anomalies.iter().any(|a| a.principal == "analyst-1"));
    assert_eq!(gw.containment().level("analyst-1"), ThreatLevel::Restricted);

    let view = gw
        .read(&analyst, "p1", DecisionLevel::Masked, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(view.level, DecisionLevel::MetadataOnly);
    assert!(view.value.is_none());

    // Reviewed behaviour does not re-contain after reinstatement.
    gw.reinstate("analyst-1", "oncall-human").unwrap();
    let rescan = gw.run_anomaly_scan().unwrap();
    assert!(rescan.iter().all(|a| a.principal != "analyst-1"));
    assert_eq!(gw.containment().level("analyst-1"), ThreatLevel::Normal);

    // Fresh co-access after the reinstatement still counts.
    for id in ["p1", "p2", "p3"] {
        let out = gw.read(&analyst, id, DecisionLevel::Masked, None).await.unwrap();
        assert_eq!(out.value().map(|v| v.level), Some(DecisionLevel::Masked));
    }
    gw.run_anomaly_scan().unwrap();
    assert_eq!(gw.containment().level("analyst-1"), ThreatLevel::Restricted);
}

// ═══════════════════════════════════════════════════════════════════════
//  Integrity
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tampered_audit_row_engages_integrity_hold() {
    let dir = tempfile::tempdir().unwrap();
    let config = config().with_data_dir(dir.path());
    let audit_db = config.audit_path();
    let gw = VaultGateway::open(config, authority()).unwrap();

    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    assert!(gw.verify_integrity().unwrap().valid);

    {
        let conn = rusqlite::Connection::open(&audit_db).unwrap();
        conn.execute("UPDATE audit_log SET detail = 'forged' WHERE sequence = 2", [])
            .unwrap();
    }

    let report = gw.verify_integrity().unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_broken, Some(2));
    assert_eq!(gw.integrity_hold().unwrap().first_broken, Some(2));
    assert!(gw.sessions().is_empty());
    assert_eq!(gw.rotation_queue().unwrap(), vec!["db-pass".to_string()]);

    let lead = Caller::new("lead-1", "acme", "cert-lead");
    let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();
    assert!(matches!(
        out.error(),
        Some(GatewayError::IntegrityViolation { sequence: Some(2) })
    ));
    assert!(gw.open_session("lead-1", "cert-lead").unwrap().error().is_some());

    assert!(gw.acknowledge_integrity("sec-op").unwrap());
    assert!(gw.integrity_hold().is_none());
    assert!(gw.open_session("lead-1", "cert-lead").unwrap().is_ok());
}

#[tokio::test]
async fn chain_survives_reopen_of_on_disk_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let config = config().with_data_dir(dir.path());
    let authority = authority();

    {
        let gw = VaultGateway::open(config.clone(), authority.clone()).unwrap();
        let lead = login(&gw, "lead-1", "cert-lead");
        seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;
    }

    let gw = VaultGateway::open(config, authority).unwrap();
    let report = gw.verify_integrity().unwrap();
    assert!(report.valid);
    assert_eq!(report.mirror_divergence, None);

    let lead = login(&gw, "lead-1", "cert-lead");
    let view = gw
        .read(&lead, "db-pass", DecisionLevel::Read, None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(view.value.as_ref().and_then(SecretValue::plaintext), Some(&b"s3cr3t"[..]));
}

// ═══════════════════════════════════════════════════════════════════════
//  Degraded dependencies
// ═══════════════════════════════════════════════════════════════════════

/// A store whose backing database is gone.
struct OfflineStore;

impl SecretStore for OfflineStore {
    fn insert(&self, _: &SecretRecord) -> warden_vault::Result<()> {
        Err(offline())
    }
    fn get(&self, _: &str) -> warden_vault::Result<SecretRecord> {
        Err(offline())
    }
    fn update(&self, _: &SecretRecord, _: u64) -> warden_vault::Result<u64> {
        Err(offline())
    }
    fn delete(&self, _: &str, _: Option<u64>) -> warden_vault::Result<()> {
        Err(offline())
    }
    fn record_access(&self, _: &str, _: DateTime<Utc>) -> warden_vault::Result<()> {
        Err(offline())
    }
    fn set_rotation_required(&self, _: &str, _: bool) -> warden_vault::Result<()> {
        Err(offline())
    }
    fn list(&self, _: Option<&str>) -> warden_vault::Result<Vec<SecretMetadata>> {
        Err(offline())
    }
    fn list_rotation_required(&self) -> warden_vault::Result<Vec<String>> {
        Err(offline())
    }
}

fn offline() -> VaultError {
    VaultError::Internal("database offline".into())
}

#[tokio::test]
async fn store_breaker_opens_and_fails_fast() {
    let config = config().with_breaker(BreakerSettings {
        failure_threshold: 2,
        open_secs: 30,
    });
    let gw = VaultGateway::new(
        config,
        KeyCache::new(authority()),
        Arc::new(OfflineStore),
        Arc::new(AuditChain::in_memory()),
        Arc::new(StaticClassifier::default()),
    )
    .unwrap();
    let lead = login(&gw, "lead-1", "cert-lead");

    for _ in 0..2 {
        let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();
        assert!(matches!(out.error(), Some(GatewayError::Vault(_))));
    }
    assert!(gw.breaker().is_open());

    let before = gw.audit().len().unwrap();
    let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();
    match out.error() {
        Some(GatewayError::ResourceUnavailable { retry_after_secs }) => {
            assert!(*retry_after_secs > 0 && *retry_after_secs <= 30);
        }
        other => panic!("expected breaker to be open, got {other:?}"),
    }
    assert_eq!(gw.audit().len().unwrap(), before + 1);
}

/// A key authority that never answers in time.
struct StalledAuthority;

#[async_trait]
impl KeyAuthority for StalledAuthority {
    async fn generate_data_key(&self, key_id: &str) -> warden_vault::Result<KeyMaterial> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(VaultError::KeyUnavailable {
            key_id: key_id.to_string(),
        })
    }
}

#[tokio::test]
async fn stalled_key_authority_is_retryable_key_unavailable() {
    let mut config = config();
    config.crypto.key_fetch_timeout_ms = 50;
    let gw = VaultGateway::in_memory(config, Arc::new(StalledAuthority)).unwrap();
    let lead = login(&gw, "lead-1", "cert-lead");

    let out = gw
        .create(&lead, "db-pass", SecretType::Credential, b"s3cr3t", None)
        .await
        .unwrap();
    let err = out.error().unwrap();
    assert!(matches!(err, GatewayError::KeyUnavailable { .. }));
    assert!(err.is_retryable());
    assert!(gw.store().list(None).unwrap().is_empty());
}

/// A key authority that answers correctly, but slowly.
struct SlowAuthority {
    inner: Arc<LocalKeyAuthority>,
    delay: Duration,
}

#[async_trait]
impl KeyAuthority for SlowAuthority {
    async fn generate_data_key(&self, key_id: &str) -> warden_vault::Result<KeyMaterial> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate_data_key(key_id).await
    }
}

#[tokio::test]
async fn grant_lapsing_during_key_fetch_aborts_before_decrypt() {
    let config = config().with_grants(OperationCeilings {
        read_secs: 1,
        ..OperationCeilings::default()
    });
    let authority = Arc::new(SlowAuthority {
        inner: authority(),
        delay: Duration::from_millis(1200),
    });
    let gw = VaultGateway::in_memory(config, authority).unwrap();
    let lead = login(&gw, "lead-1", "cert-lead");
    seed(&gw, &lead, "db-pass", SecretType::Credential, b"s3cr3t").await;

    // Force the read to go back to the slow authority.
    gw.invalidate_key("kek-1").await;

    let before = gw.audit().len().unwrap();
    let out = gw.read(&lead, "db-pass", DecisionLevel::Read, None).await.unwrap();

    assert!(matches!(
        out.error(),
        Some(GatewayError::SessionInvalid {
            failure: SessionFailure::Expired
        })
    ));
    assert!(out.grant().is_some());

    let appended = gw.audit().events_from(before as u64 + 1).unwrap();
    assert_eq!(appended.len(), 2);
    assert_eq!(appended[0].kind, AuditKind::AccessDecision);
    assert_eq!(appended[0].outcome, AuditOutcome::Granted);
    assert_eq!(appended[1].kind, AuditKind::Operation);
    assert_eq!(appended[1].outcome, AuditOutcome::Denied);
    assert_eq!(appended[1].target.as_deref(), Some("db-pass"));
    assert_eq!(appended[1].hash, out.audit.hash);

    assert_eq!(gw.store().get("db-pass").unwrap().access_count, 0);
}
