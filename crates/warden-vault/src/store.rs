//! Durable secret store with optimistic concurrency.
//!
//! The store only ever sees envelopes: plaintext never reaches this layer.
//! [`SecretStore`] is the seam the gateway talks to (wrapped by its circuit
//! breaker); [`SqliteSecretStore`] is the bundled implementation.
//!
//! # Versioning
//!
//! Every record starts at version 1. [`SecretStore::update`] succeeds only
//! if the caller's `expected_version` matches the stored one, and bumps the
//! version by exactly one. A mismatch is [`VaultError::VersionConflict`].

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::envelope::Envelope;
use crate::error::{Result, VaultError};
use crate::types::{SecretType, SensitivityTier};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A secret as persisted: metadata plus its envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub secret_type: SecretType,
    /// SHA-256 of the owning principal id; the raw id is never stored.
    pub owner_hash: String,
    pub tenant: String,
    pub envelope: Envelope,
    pub key_id: String,
    pub tier: SensitivityTier,
    /// Field labels assigned by the classifier (e.g. `national_id`).
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub version: u64,
    /// Set after repeated decryption failures; cleared by a rotation.
    pub rotation_required: bool,
}

impl SecretRecord {
    /// Hash a principal id into an owner reference.
    pub fn owner_hash_for(principal_id: &str) -> String {
        crypto::sha256_hex(principal_id.as_bytes())
    }

    /// Everything except the envelope.
    pub fn metadata(&self) -> SecretMetadata {
        SecretMetadata {
            id: self.id.clone(),
            secret_type: self.secret_type,
            owner_hash: self.owner_hash.clone(),
            tenant: self.tenant.clone(),
            key_id: self.key_id.clone(),
            tier: self.tier,
            labels: self.labels.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            version: self.version,
            rotation_required: self.rotation_required,
        }
    }
}

/// Secret metadata without ciphertext, safe to return at any decision level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub id: String,
    pub secret_type: SecretType,
    pub owner_hash: String,
    pub tenant: String,
    pub key_id: String,
    pub tier: SensitivityTier,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub version: u64,
    pub rotation_required: bool,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Keyed CRUD over secret records with optimistic version checks.
pub trait SecretStore: Send + Sync {
    /// Insert a new record. Fails with [`VaultError::SecretAlreadyExists`].
    fn insert(&self, record: &SecretRecord) -> Result<()>;

    /// Fetch a record. Fails with [`VaultError::SecretNotFound`].
    fn get(&self, id: &str) -> Result<SecretRecord>;

    /// Replace envelope/labels/tier/rotation flag if the stored version is
    /// `expected_version`. Returns the new version.
    fn update(&self, record: &SecretRecord, expected_version: u64) -> Result<u64>;

    /// Delete a record, optionally checking its version first.
    fn delete(&self, id: &str, expected_version: Option<u64>) -> Result<()>;

    /// Bump usage counters after a granted read.
    fn record_access(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Set or clear the mandatory-rotation flag.
    fn set_rotation_required(&self, id: &str, required: bool) -> Result<()>;

    /// List metadata, optionally restricted to one tenant.
    fn list(&self, tenant: Option<&str>) -> Result<Vec<SecretMetadata>>;

    /// Ids of secrets flagged for mandatory rotation.
    fn list_rotation_required(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// SQLite-backed [`SecretStore`].
///
/// The connection sits behind a `Mutex`; every call holds it only for the
/// duration of one statement (or one read-modify-write).
pub struct SqliteSecretStore {
    conn: Mutex<Connection>,
}

impl SqliteSecretStore {
    /// Open (or create) a store at `path`. Runs schema migrations.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening secret store");

        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("secret store mutex poisoned: {e}")))
    }

    fn current_version(conn: &Connection, id: &str) -> Result<Option<u64>> {
        let version = conn
            .query_row(
                "SELECT version FROM secrets WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

/// Configure SQLite pragmas for durability and concurrency.
pub(crate) fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    tracing::debug!("running secret store migrations");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS secrets (
            id                TEXT PRIMARY KEY,
            secret_type       TEXT NOT NULL CHECK(secret_type IN ('credential','pii','financial','token','certificate')),
            owner_hash        TEXT NOT NULL,
            tenant            TEXT NOT NULL,
            envelope          TEXT NOT NULL,
            key_id            TEXT NOT NULL,
            tier              TEXT NOT NULL CHECK(tier IN ('public','internal','sensitive','restricted')),
            labels            TEXT NOT NULL DEFAULT '[]',
            created_at        INTEGER NOT NULL,
            updated_at        INTEGER NOT NULL,
            last_accessed_at  INTEGER,
            access_count      INTEGER NOT NULL DEFAULT 0,
            version           INTEGER NOT NULL,
            rotation_required INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_secrets_tenant ON secrets(tenant);
        CREATE INDEX IF NOT EXISTS idx_secrets_key ON secrets(key_id);",
    )
    .map_err(|e| VaultError::MigrationFailed {
        reason: e.to_string(),
    })?;
    Ok(())
}

impl SecretStore for SqliteSecretStore {
    fn insert(&self, record: &SecretRecord) -> Result<()> {
        let conn = self.lock()?;

        if Self::current_version(&conn, &record.id)?.is_some() {
            return Err(VaultError::SecretAlreadyExists {
                id: record.id.clone(),
            });
        }

        conn.execute(
            "INSERT INTO secrets (id, secret_type, owner_hash, tenant, envelope, key_id, tier, labels,
                                  created_at, updated_at, last_accessed_at, access_count, version, rotation_required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.secret_type.as_str(),
                record.owner_hash,
                record.tenant,
                record.envelope.to_json()?,
                record.key_id,
                record.tier.as_str(),
                serde_json::to_string(&record.labels)?,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
                record.last_accessed_at.map(|t| t.timestamp_millis()),
                record.access_count as i64,
                record.version as i64,
                record.rotation_required,
            ],
        )?;

        tracing::info!(
            id = %record.id,
            secret_type = %record.secret_type,
            tier = %record.tier,
            "stored secret"
        );
        Ok(())
    }

    fn get(&self, id: &str) -> Result<SecretRecord> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, secret_type, owner_hash, tenant, envelope, key_id, tier, labels,
                        created_at, updated_at, last_accessed_at, access_count, version, rotation_required
                 FROM secrets WHERE id = ?1",
                params![id],
                map_secret_row,
            )
            .optional()?;

        let row = row.ok_or_else(|| VaultError::SecretNotFound { id: id.to_string() })?;
        row.into_record()
    }

    fn update(&self, record: &SecretRecord, expected_version: u64) -> Result<u64> {
        let conn = self.lock()?;
        let now = Utc::now().timestamp_millis();

        let rows = conn.execute(
            "UPDATE secrets
             SET envelope = ?1, key_id = ?2, tier = ?3, labels = ?4, updated_at = ?5,
                 rotation_required = ?6, version = version + 1
             WHERE id = ?7 AND version = ?8",
            params![
                record.envelope.to_json()?,
                record.key_id,
                record.tier.as_str(),
                serde_json::to_string(&record.labels)?,
                now,
                record.rotation_required,
                record.id,
                expected_version as i64,
            ],
        )?;

        if rows == 0 {
            return match Self::current_version(&conn, &record.id)? {
                Some(actual) => Err(VaultError::VersionConflict {
                    id: record.id.clone(),
                    expected: expected_version,
                    actual,
                }),
                None => Err(VaultError::SecretNotFound {
                    id: record.id.clone(),
                }),
            };
        }

        tracing::info!(id = %record.id, version = expected_version + 1, "updated secret");
        Ok(expected_version + 1)
    }

    fn delete(&self, id: &str, expected_version: Option<u64>) -> Result<()> {
        let conn = self.lock()?;

        let actual = Self::current_version(&conn, id)?
            .ok_or_else(|| VaultError::SecretNotFound { id: id.to_string() })?;
        if let Some(expected) = expected_version
            && expected != actual
        {
            return Err(VaultError::VersionConflict {
                id: id.to_string(),
                expected,
                actual,
            });
        }

        conn.execute(
            "DELETE FROM secrets WHERE id = ?1 AND version = ?2",
            params![id, actual as i64],
        )?;

        tracing::info!(id = id, "deleted secret");
        Ok(())
    }

    fn record_access(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE secrets SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
            params![at.timestamp_millis(), id],
        )?;
        if rows == 0 {
            return Err(VaultError::SecretNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn set_rotation_required(&self, id: &str, required: bool) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE secrets SET rotation_required = ?1 WHERE id = ?2",
            params![required, id],
        )?;
        if rows == 0 {
            return Err(VaultError::SecretNotFound { id: id.to_string() });
        }
        if required {
            tracing::warn!(id = id, "secret marked for mandatory rotation");
        }
        Ok(())
    }

    fn list(&self, tenant: Option<&str>) -> Result<Vec<SecretMetadata>> {
        let conn = self.lock()?;
        let sql = match tenant {
            Some(_) => {
                "SELECT id, secret_type, owner_hash, tenant, envelope, key_id, tier, labels,
                        created_at, updated_at, last_accessed_at, access_count, version, rotation_required
                 FROM secrets WHERE tenant = ?1 ORDER BY id"
            }
            None => {
                "SELECT id, secret_type, owner_hash, tenant, envelope, key_id, tier, labels,
                        created_at, updated_at, last_accessed_at, access_count, version, rotation_required
                 FROM secrets ORDER BY id"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<SecretRow> = if let Some(t) = tenant {
            stmt.query_map(params![t], map_secret_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], map_secret_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.into_record()?.metadata());
        }

        tracing::debug!(count = out.len(), "listed secrets");
        Ok(out)
    }

    fn list_rotation_required(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id FROM secrets WHERE rotation_required = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Internal row types (avoid leaking rusqlite details)
// ---------------------------------------------------------------------------

struct SecretRow {
    id: String,
    secret_type: String,
    owner_hash: String,
    tenant: String,
    envelope: String,
    key_id: String,
    tier: String,
    labels: String,
    created_at: i64,
    updated_at: i64,
    last_accessed_at: Option<i64>,
    access_count: i64,
    version: i64,
    rotation_required: bool,
}

fn map_secret_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecretRow> {
    Ok(SecretRow {
        id: row.get(0)?,
        secret_type: row.get(1)?,
        owner_hash: row.get(2)?,
        tenant: row.get(3)?,
        envelope: row.get(4)?,
        key_id: row.get(5)?,
        tier: row.get(6)?,
        labels: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        last_accessed_at: row.get(10)?,
        access_count: row.get(11)?,
        version: row.get(12)?,
        rotation_required: row.get(13)?,
    })
}

impl SecretRow {
    fn into_record(self) -> Result<SecretRecord> {
        let secret_type = SecretType::parse(&self.secret_type)
            .ok_or_else(|| VaultError::Internal(format!("bad secret_type: {}", self.secret_type)))?;
        let tier = SensitivityTier::parse(&self.tier)
            .ok_or_else(|| VaultError::Internal(format!("bad tier: {}", self.tier)))?;

        Ok(SecretRecord {
            id: self.id,
            secret_type,
            owner_hash: self.owner_hash,
            tenant: self.tenant,
            envelope: Envelope::from_json(&self.envelope)?,
            key_id: self.key_id,
            tier,
            labels: serde_json::from_str(&self.labels)?,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            last_accessed_at: self.last_accessed_at.and_then(DateTime::from_timestamp_millis),
            access_count: self.access_count as u64,
            version: self.version as u64,
            rotation_required: self.rotation_required,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
