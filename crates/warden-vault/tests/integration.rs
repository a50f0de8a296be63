//! Integration tests for the warden-vault crate.
//!
//! These tests exercise the vault core end to end: master key bootstrap,
//! envelope encryption through the key cache, persistence of envelopes in
//! the secret store, and the audit chain over SQLite with a JSONL mirror.

use std::sync::Arc;

use chrono::Utc;
use warden_vault::audit::{AuditChain, AuditEvent, AuditKind, AuditOutcome, JsonlMirror, SqliteAuditSink};
use warden_vault::envelope::{EncryptionMode, EnvelopeEngine};
use warden_vault::keychain::{FileKeychain, load_or_init_master_key};
use warden_vault::keys::{KeyCache, LocalKeyAuthority};
use warden_vault::store::{SecretRecord, SecretStore, SqliteSecretStore};
use warden_vault::types::{Operation, SecretType, SensitivityTier};
use warden_vault::VaultError;

fn engine_with(keys: &[&str]) -> (Arc<LocalKeyAuthority>, EnvelopeEngine) {
    let authority = Arc::new(LocalKeyAuthority::new(&[9u8; 32]).unwrap());
    for k in keys {
        authority.register(k);
    }
    let engine = EnvelopeEngine::new(KeyCache::new(authority.clone()));
    (authority, engine)
}

fn record_for(id: &str, envelope: warden_vault::Envelope) -> SecretRecord {
    let now = Utc::now();
    SecretRecord {
        id: id.into(),
        secret_type: SecretType::Credential,
        owner_hash: SecretRecord::owner_hash_for("lead-1"),
        tenant: "acme".into(),
        key_id: envelope.key_id.clone(),
        envelope,
        tier: SensitivityTier::Restricted,
        labels: vec![],
        created_at: now,
        updated_at: now,
        last_accessed_at: None,
        access_count: 0,
        version: 1,
        rotation_required: false,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Master key bootstrap
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn file_keychain_master_key_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = FileKeychain::default_path(dir.path());

    let envelope = {
        let master = load_or_init_master_key(&FileKeychain::new(&path)).unwrap();
        let authority = Arc::new(LocalKeyAuthority::new(&master).unwrap());
        authority.register("kek-1");
        let engine = EnvelopeEngine::new(KeyCache::new(authority));
        engine.encrypt(b"persisted", "kek-1", None).await.unwrap()
    };

    let master = load_or_init_master_key(&FileKeychain::new(&path)).unwrap();
    let authority = Arc::new(LocalKeyAuthority::new(&master).unwrap());
    authority.register("kek-1");
    let engine = EnvelopeEngine::new(KeyCache::new(authority));
    assert_eq!(engine.decrypt(&envelope, None).await.unwrap(), b"persisted");
}

// ═══════════════════════════════════════════════════════════════════════
//  Envelopes at rest
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stored_envelope_decrypts_after_roundtrip_through_sqlite() {
    let (_authority, engine) = engine_with(&["kek-1"]);
    let store = SqliteSecretStore::open_in_memory().unwrap();

    let envelope = engine.encrypt(b"s3cr3t", "kek-1", Some(b"s1")).await.unwrap();
    store.insert(&record_for("s1", envelope)).unwrap();

    let loaded = store.get("s1").unwrap();
    let plaintext = engine.decrypt(&loaded.envelope, Some(b"s1")).await.unwrap();
    assert_eq!(plaintext, b"s3cr3t");
}

#[tokio::test]
async fn rotation_then_deprecation_keeps_data_readable() {
    let (authority, engine) = engine_with(&["kek-1", "kek-2"]);
    let store = SqliteSecretStore::open_in_memory().unwrap();

    let envelope = engine.encrypt(b"rotate me", "kek-1", None).await.unwrap();
    store.insert(&record_for("s1", envelope)).unwrap();

    let mut rec = store.get("s1").unwrap();
    rec.envelope = engine.rotate_key(&rec.envelope, "kek-2", None).await.unwrap();
    rec.key_id = "kek-2".into();
    store.update(&rec, rec.version).unwrap();

    authority.deprecate("kek-1").unwrap();
    engine.key_cache().invalidate("kek-1").await;

    let loaded = store.get("s1").unwrap();
    assert_eq!(loaded.key_id, "kek-2");
    assert_eq!(loaded.version, 2);
    assert_eq!(engine.decrypt(&loaded.envelope, None).await.unwrap(), b"rotate me");

    let err = engine.encrypt(b"new", "kek-1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::KeyDeprecated { .. }));
}

#[tokio::test]
async fn revoked_key_blocks_decryption_after_invalidate() {
    let (authority, engine) = engine_with(&["kek-1"]);
    let envelope = engine.encrypt(b"x", "kek-1", None).await.unwrap();

    authority.revoke("kek-1").unwrap();
    engine.key_cache().invalidate("kek-1").await;

    let err = engine.decrypt(&envelope, None).await.unwrap_err();
    assert!(matches!(err, VaultError::KeyRevoked { .. }));
}

#[tokio::test]
async fn deterministic_envelopes_support_equality_lookup() {
    let (_authority, engine) = engine_with(&["kek-1"]);

    let a = engine
        .encrypt_deterministic(b"alice@example.com", "kek-1", b"email", SensitivityTier::Sensitive)
        .await
        .unwrap();
    let b = engine
        .encrypt_deterministic(b"alice@example.com", "kek-1", b"email", SensitivityTier::Sensitive)
        .await
        .unwrap();

    assert_eq!(a.mode, EncryptionMode::Deterministic);
    assert_eq!(a.fingerprint(), b.fingerprint());

    let err = engine
        .encrypt_deterministic(b"4111", "kek-1", b"pan", SensitivityTier::Restricted)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::DeterministicForbidden { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Audit chain on disk
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn audit_chain_with_mirror_detects_offline_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("audit.db");
    let chain = AuditChain::open(
        Box::new(SqliteAuditSink::open(&db).unwrap()),
        Some(Box::new(JsonlMirror::open(dir.path().join("audit.jsonl")).unwrap())),
    )
    .unwrap();

    for i in 0..5 {
        let event = AuditEvent::new(AuditKind::AccessDecision, format!("agent-{i}"), AuditOutcome::Granted)
            .with_target("s1")
            .with_operation(Operation::Read);
        chain.append(event).unwrap();
    }

    let clean = chain.verify_report().unwrap();
    assert!(clean.valid);
    assert_eq!(clean.checked, 5);
    assert_eq!(clean.mirror_divergence, None);

    // Rewrite one stored field offline.
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute(
        "UPDATE audit_log SET detail = 'rewritten' WHERE sequence = 2",
        [],
    )
    .unwrap();

    let report = chain.verify_report().unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_broken, Some(2));
    // Stored hash columns were not touched, so they still match the mirror.
    assert_eq!(report.mirror_divergence, None);

    assert!(!chain.verify_chain().unwrap());
}

#[test]
fn deleted_tail_row_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("audit.db");
    let chain = AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();

    for _ in 0..3 {
        chain
            .append(AuditEvent::new(AuditKind::Session, "agent", AuditOutcome::Succeeded))
            .unwrap();
    }

    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute("DELETE FROM audit_log WHERE sequence = 3", []).unwrap();

    let report = chain.verify_report().unwrap();
    assert_eq!(report.first_broken, Some(3));
}
