//! Tamper-evident, hash-chained audit log.
//!
//! Every event carries the hash of its predecessor and its own hash, computed
//! as SHA-256 over a canonical JSON encoding of all of its fields plus the
//! previous hash. Rewriting any stored byte breaks the chain at that event.
//!
//! [`AuditChain::append`] is the single serialized choke point: the hash
//! computation and the durable write happen under one lock. Each event is
//! written to the primary [`AuditSink`] and then to a write-once
//! [`AuditMirror`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::store::configure_connection;
use crate::types::{Operation, SecretType, SensitivityTier};

/// `prev_hash` of the first event in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// An access decision (one per evaluation).
    AccessDecision,
    /// A gateway operation after the decision (execution result).
    Operation,
    /// Session lifecycle: open, close, revoke, reap.
    Session,
    /// Binding mismatches, decryption failures, anomalies.
    Security,
    /// Containment state changes and reinstatements.
    Containment,
    /// Chain verification results.
    Integrity,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDecision => "access_decision",
            Self::Operation => "operation",
            Self::Session => "session",
            Self::Security => "security",
            Self::Containment => "containment",
            Self::Integrity => "integrity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "access_decision" => Some(Self::AccessDecision),
            "operation" => Some(Self::Operation),
            "session" => Some(Self::Session),
            "security" => Some(Self::Security),
            "containment" => Some(Self::Containment),
            "integrity" => Some(Self::Integrity),
            _ => None,
        }
    }
}

/// Result recorded for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Granted,
    Denied,
    Succeeded,
    Failed,
    Alert,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Alert => "alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "granted" => Some(Self::Granted),
            "denied" => Some(Self::Denied),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// An immutable audit event.
///
/// Build one with [`AuditEvent::new`] and the `with_*` setters, then hand it
/// to [`AuditChain::append`], which assigns `sequence`, `prev_hash` and
/// `hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub severity: Severity,
    pub principal: String,
    pub target: Option<String>,
    pub operation: Option<Operation>,
    pub outcome: AuditOutcome,
    pub justification: Option<String>,
    pub secret_type: Option<SecretType>,
    pub tier: Option<SensitivityTier>,
    pub labels: Vec<String>,
    pub detail: Option<String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Everything that goes into an event hash, in a fixed field order.
#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a Uuid,
    sequence: u64,
    timestamp: String,
    kind: &'static str,
    severity: &'static str,
    principal: &'a str,
    target: Option<&'a str>,
    operation: Option<&'static str>,
    outcome: &'static str,
    justification: Option<&'a str>,
    secret_type: Option<&'static str>,
    tier: Option<&'static str>,
    labels: &'a [String],
    detail: Option<&'a str>,
    prev_hash: &'a str,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, principal: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            sequence: 0,
            timestamp: Utc::now(),
            kind,
            severity: Severity::Info,
            principal: principal.into(),
            target: None,
            operation: None,
            outcome,
            justification: None,
            secret_type: None,
            tier: None,
            labels: Vec::new(),
            detail: None,
            prev_hash: String::new(),
            hash: String::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_justification(mut self, justification: Option<&str>) -> Self {
        self.justification = justification.map(str::to_string);
        self
    }

    pub fn with_classification(
        mut self,
        secret_type: SecretType,
        tier: SensitivityTier,
        labels: &[String],
    ) -> Self {
        self.secret_type = Some(secret_type);
        self.tier = Some(tier);
        self.labels = labels.to_vec();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Override the timestamp (deterministic tests, replay).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Storage/hash representation of the timestamp.
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Recompute this event's hash from its fields and `prev_hash`.
    pub fn compute_hash(&self) -> Result<String> {
        let input = HashInput {
            id: &self.id,
            sequence: self.sequence,
            timestamp: self.timestamp_string(),
            kind: self.kind.as_str(),
            severity: self.severity.as_str(),
            principal: &self.principal,
            target: self.target.as_deref(),
            operation: self.operation.map(|o| o.as_str()),
            outcome: self.outcome.as_str(),
            justification: self.justification.as_deref(),
            secret_type: self.secret_type.map(|t| t.as_str()),
            tier: self.tier.map(|t| t.as_str()),
            labels: &self.labels,
            detail: self.detail.as_deref(),
            prev_hash: &self.prev_hash,
        };
        let canonical = serde_json::to_vec(&input)?;
        Ok(crypto::sha256_hex(&canonical))
    }
}

/// Reference returned by [`AuditChain::append`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRef {
    pub id: Uuid,
    pub sequence: u64,
    pub hash: String,
}

/// Result of a full chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub valid: bool,
    /// Number of events examined.
    pub checked: u64,
    /// Sequence of the first event whose link or hash does not verify.
    pub first_broken: Option<u64>,
    /// First sequence where the mirror disagrees with the primary sink.
    pub mirror_divergence: Option<u64>,
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Primary durable storage for audit events.
pub trait AuditSink: Send + Sync {
    fn write(&self, event: &AuditEvent) -> Result<()>;

    /// All events in sequence order.
    fn load_all(&self) -> Result<Vec<AuditEvent>>;

    /// Events with `timestamp >= since`, in sequence order.
    fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>> {
        let mut events = self.load_all()?;
        events.retain(|e| e.timestamp >= since);
        Ok(events)
    }

    /// Events recorded for one principal, in sequence order.
    fn load_for(&self, principal: &str) -> Result<Vec<AuditEvent>> {
        let mut events = self.load_all()?;
        events.retain(|e| e.principal == principal);
        Ok(events)
    }

    /// The last `n` events, oldest first.
    fn load_tail(&self, n: usize) -> Result<Vec<AuditEvent>> {
        let mut events = self.load_all()?;
        let start = events.len().saturating_sub(n);
        Ok(events.split_off(start))
    }

    /// Events with `sequence >= from`, in sequence order.
    fn load_from(&self, from: u64) -> Result<Vec<AuditEvent>> {
        let mut events = self.load_all()?;
        events.retain(|e| e.sequence >= from);
        Ok(events)
    }
}

/// Secondary write-once store. An entry, once written, is never replaced.
pub trait AuditMirror: Send + Sync {
    fn write_once(&self, event: &AuditEvent) -> Result<()>;

    /// All mirrored events in sequence order.
    fn entries(&self) -> Result<Vec<AuditEvent>>;
}

/// SQLite-backed [`AuditSink`].
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening audit log");
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                sequence      INTEGER PRIMARY KEY,
                id            TEXT NOT NULL UNIQUE,
                timestamp     TEXT NOT NULL,
                kind          TEXT NOT NULL,
                severity      TEXT NOT NULL,
                principal     TEXT NOT NULL,
                target        TEXT,
                operation     TEXT,
                outcome       TEXT NOT NULL,
                justification TEXT,
                secret_type   TEXT,
                tier          TEXT,
                labels        TEXT NOT NULL DEFAULT '[]',
                detail        TEXT,
                prev_hash     TEXT NOT NULL,
                hash          TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_principal ON audit_log(principal);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);",
        )
        .map_err(|e| VaultError::MigrationFailed {
            reason: e.to_string(),
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("audit sink mutex poisoned: {e}")))
    }
}

impl AuditSink for SqliteAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log (sequence, id, timestamp, kind, severity, principal, target, operation,
                                    outcome, justification, secret_type, tier, labels, detail, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                event.sequence as i64,
                event.id.to_string(),
                event.timestamp_string(),
                event.kind.as_str(),
                event.severity.as_str(),
                event.principal,
                event.target,
                event.operation.map(|o| o.as_str()),
                event.outcome.as_str(),
                event.justification,
                event.secret_type.map(|t| t.as_str()),
                event.tier.map(|t| t.as_str()),
                serde_json::to_string(&event.labels)?,
                event.detail,
                event.prev_hash,
                event.hash,
            ],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEvent>> {
        self.query("ORDER BY sequence ASC", [])
    }

    fn load_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>> {
        // RFC 3339 with fixed nanosecond width and `Z` sorts lexically.
        let since = since.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.query("WHERE timestamp >= ?1 ORDER BY sequence ASC", params![since])
    }

    fn load_for(&self, principal: &str) -> Result<Vec<AuditEvent>> {
        self.query("WHERE principal = ?1 ORDER BY sequence ASC", params![principal])
    }

    fn load_tail(&self, n: usize) -> Result<Vec<AuditEvent>> {
        let mut events = self.query(
            "ORDER BY sequence DESC LIMIT ?1",
            params![i64::try_from(n).unwrap_or(i64::MAX)],
        )?;
        events.reverse();
        Ok(events)
    }

    fn load_from(&self, from: u64) -> Result<Vec<AuditEvent>> {
        self.query(
            "WHERE sequence >= ?1 ORDER BY sequence ASC",
            params![i64::try_from(from).unwrap_or(i64::MAX)],
        )
    }
}

impl SqliteAuditSink {
    fn query(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<AuditEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT sequence, id, timestamp, kind, severity, principal, target, operation,
                    outcome, justification, secret_type, tier, labels, detail, prev_hash, hash
             FROM audit_log {clause}"
        ))?;
        let rows = stmt
            .query_map(args, map_audit_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(AuditRow::into_event).collect()
    }
}

struct AuditRow {
    sequence: i64,
    id: String,
    timestamp: String,
    kind: String,
    severity: String,
    principal: String,
    target: Option<String>,
    operation: Option<String>,
    outcome: String,
    justification: Option<String>,
    secret_type: Option<String>,
    tier: Option<String>,
    labels: String,
    detail: Option<String>,
    prev_hash: String,
    hash: String,
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok(AuditRow {
        sequence: row.get(0)?,
        id: row.get(1)?,
        timestamp: row.get(2)?,
        kind: row.get(3)?,
        severity: row.get(4)?,
        principal: row.get(5)?,
        target: row.get(6)?,
        operation: row.get(7)?,
        outcome: row.get(8)?,
        justification: row.get(9)?,
        secret_type: row.get(10)?,
        tier: row.get(11)?,
        labels: row.get(12)?,
        detail: row.get(13)?,
        prev_hash: row.get(14)?,
        hash: row.get(15)?,
    })
}

impl AuditRow {
    fn into_event(self) -> Result<AuditEvent> {
        let bad = |field: &str, value: &str| VaultError::Internal(format!("bad audit {field}: {value}"));

        let operation = match self.operation.as_deref() {
            Some(s) => Some(Operation::parse(s).ok_or_else(|| bad("operation", s))?),
            None => None,
        };
        let secret_type = match self.secret_type.as_deref() {
            Some(s) => Some(SecretType::parse(s).ok_or_else(|| bad("secret_type", s))?),
            None => None,
        };
        let tier = match self.tier.as_deref() {
            Some(s) => Some(SensitivityTier::parse(s).ok_or_else(|| bad("tier", s))?),
            None => None,
        };

        Ok(AuditEvent {
            id: Uuid::parse_str(&self.id).map_err(|_| bad("id", &self.id))?,
            sequence: self.sequence as u64,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| bad("timestamp", &self.timestamp))?,
            kind: AuditKind::parse(&self.kind).ok_or_else(|| bad("kind", &self.kind))?,
            severity: Severity::parse(&self.severity).ok_or_else(|| bad("severity", &self.severity))?,
            principal: self.principal,
            target: self.target,
            operation,
            outcome: AuditOutcome::parse(&self.outcome).ok_or_else(|| bad("outcome", &self.outcome))?,
            justification: self.justification,
            secret_type,
            tier,
            labels: serde_json::from_str(&self.labels)?,
            detail: self.detail,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}

/// In-memory [`AuditSink`].
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<AuditEvent>>> {
        self.events
            .lock()
            .map_err(|e| VaultError::Internal(format!("audit sink mutex poisoned: {e}")))
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, event: &AuditEvent) -> Result<()> {
        self.lock()?.push(event.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEvent>> {
        Ok(self.lock()?.clone())
    }
}

// ---------------------------------------------------------------------------
// Mirrors
// ---------------------------------------------------------------------------

/// Append-only JSON-lines mirror. Sequences must strictly increase.
pub struct JsonlMirror {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

struct JsonlState {
    file: File,
    last_sequence: u64,
}

impl JsonlMirror {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let last_sequence = read_jsonl(&path)?.last().map(|e| e.sequence).unwrap_or(0);

        tracing::info!(path = %path.display(), last_sequence, "opened audit mirror");
        Ok(Self {
            path,
            state: Mutex::new(JsonlState {
                file,
                last_sequence,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<AuditEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

impl AuditMirror for JsonlMirror {
    fn write_once(&self, event: &AuditEvent) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| VaultError::MirrorWriteFailed {
                reason: format!("mirror mutex poisoned: {e}"),
            })?;

        if event.sequence <= state.last_sequence {
            return Err(VaultError::MirrorWriteFailed {
                reason: format!("sequence {} already mirrored", event.sequence),
            });
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let file = &mut state.file;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| VaultError::MirrorWriteFailed {
                reason: e.to_string(),
            })?;
        state.last_sequence = event.sequence;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEvent>> {
        read_jsonl(&self.path)
    }
}

/// In-memory write-once mirror.
#[derive(Default)]
pub struct MemoryMirror {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditMirror for MemoryMirror {
    fn write_once(&self, event: &AuditEvent) -> Result<()> {
        let mut events = self.events.lock().map_err(|e| VaultError::MirrorWriteFailed {
            reason: format!("mirror mutex poisoned: {e}"),
        })?;
        if events.last().is_some_and(|last| last.sequence >= event.sequence) {
            return Err(VaultError::MirrorWriteFailed {
                reason: format!("sequence {} already mirrored", event.sequence),
            });
        }
        events.push(event.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEvent>> {
        self.events
            .lock()
            .map(|e| e.clone())
            .map_err(|e| VaultError::Internal(format!("mirror mutex poisoned: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

struct ChainState {
    next_sequence: u64,
    last_hash: String,
}

/// The hash chain: durable sink, write-once mirror and the last-hash cursor.
/// Queries read back from the sink; only the cursor is held in memory.
pub struct AuditChain {
    sink: Box<dyn AuditSink>,
    mirror: Option<Box<dyn AuditMirror>>,
    state: Mutex<ChainState>,
}

impl AuditChain {
    /// Open a chain over `sink`, resuming the cursor from its last event.
    pub fn open(sink: Box<dyn AuditSink>, mirror: Option<Box<dyn AuditMirror>>) -> Result<Self> {
        let (next_sequence, last_hash) = match sink.load_tail(1)?.pop() {
            Some(last) => (last.sequence + 1, last.hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        tracing::info!(next_sequence, "audit chain opened");
        Ok(Self {
            sink,
            mirror,
            state: Mutex::new(ChainState {
                next_sequence,
                last_hash,
            }),
        })
    }

    /// Chain over an in-memory sink and mirror.
    pub fn in_memory() -> Self {
        Self {
            sink: Box::new(MemoryAuditSink::new()),
            mirror: Some(Box::new(MemoryMirror::new())),
            state: Mutex::new(ChainState {
                next_sequence: 1,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ChainState>> {
        self.state
            .lock()
            .map_err(|e| VaultError::Internal(format!("audit chain mutex poisoned: {e}")))
    }

    /// Link `event` to the chain and write it durably.
    ///
    /// The cursor only advances once the primary write succeeded. A mirror
    /// failure is logged and later surfaces as mirror divergence.
    pub fn append(&self, mut event: AuditEvent) -> Result<AuditRef> {
        let mut state = self.lock()?;

        event.sequence = state.next_sequence;
        event.prev_hash = state.last_hash.clone();
        event.hash = event.compute_hash()?;

        self.sink.write(&event)?;

        if let Some(mirror) = &self.mirror
            && let Err(e) = mirror.write_once(&event)
        {
            tracing::error!(sequence = event.sequence, error = %e, "audit mirror write failed");
        }

        state.next_sequence += 1;
        state.last_hash = event.hash.clone();

        let receipt = AuditRef {
            id: event.id,
            sequence: event.sequence,
            hash: event.hash.clone(),
        };

        tracing::debug!(
            sequence = event.sequence,
            kind = event.kind.as_str(),
            outcome = event.outcome.as_str(),
            principal = %event.principal,
            "audit event appended"
        );

        Ok(receipt)
    }

    /// Recompute every stored hash. `false` means the chain was altered.
    pub fn verify_chain(&self) -> Result<bool> {
        Ok(self.verify_report()?.valid)
    }

    /// Recompute every stored hash, compare against the mirror, and append a
    /// critical integrity event if the chain is broken.
    pub fn verify_report(&self) -> Result<ChainReport> {
        let (stored, expected_len) = {
            let state = self.lock()?;
            (self.sink.load_all()?, state.next_sequence - 1)
        };

        let mut prev = GENESIS_HASH.to_string();
        let mut first_broken = None;
        let mut checked = 0u64;

        for (idx, event) in stored.iter().enumerate() {
            checked += 1;
            let expected_sequence = idx as u64 + 1;
            let recomputed = event.compute_hash()?;
            if event.sequence != expected_sequence
                || event.prev_hash != prev
                || event.hash != recomputed
            {
                first_broken = Some(expected_sequence);
                break;
            }
            prev = event.hash.clone();
        }

        if first_broken.is_none() && (stored.len() as u64) < expected_len {
            first_broken = Some(stored.len() as u64 + 1);
        }

        let mirror_divergence = match &self.mirror {
            Some(mirror) => first_divergence(&stored, &mirror.entries()?),
            None => None,
        };

        let report = ChainReport {
            valid: first_broken.is_none(),
            checked,
            first_broken,
            mirror_divergence,
        };

        if let Some(sequence) = first_broken {
            tracing::error!(sequence, "audit chain integrity violation");
            let event = AuditEvent::new(AuditKind::Integrity, "system", AuditOutcome::Alert)
                .with_severity(Severity::Critical)
                .with_detail(format!("chain broken at sequence {sequence}"));
            self.append(event)?;
        } else if let Some(sequence) = mirror_divergence {
            tracing::warn!(sequence, "audit mirror diverges from primary");
        } else {
            tracing::info!(checked, "audit chain verified");
        }

        Ok(report)
    }

    /// Events with `timestamp >= since`.
    pub fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<AuditEvent>> {
        self.sink.load_since(since)
    }

    /// Events recorded for one principal.
    pub fn events_for(&self, principal: &str) -> Result<Vec<AuditEvent>> {
        self.sink.load_for(principal)
    }

    /// Events with `sequence >= from`.
    pub fn events_from(&self, from: u64) -> Result<Vec<AuditEvent>> {
        self.sink.load_from(from)
    }

    /// The last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEvent>> {
        self.sink.load_tail(n)
    }

    /// Number of events appended to the chain.
    pub fn len(&self) -> Result<usize> {
        Ok((self.lock()?.next_sequence - 1) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn last_hash(&self) -> Result<String> {
        Ok(self.lock()?.last_hash.clone())
    }
}

fn first_divergence(primary: &[AuditEvent], mirror: &[AuditEvent]) -> Option<u64> {
    let longest = primary.len().max(mirror.len());
    (0..longest)
        .find(|&i| match (primary.get(i), mirror.get(i)) {
            (Some(p), Some(m)) => p.sequence != m.sequence || p.hash != m.hash,
            _ => true,
        })
        .map(|i| i as u64 + 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(principal: &str) -> AuditEvent {
        AuditEvent::new(AuditKind::AccessDecision, principal, AuditOutcome::Granted)
            .with_target("s1")
            .with_operation(Operation::Read)
            .with_classification(SecretType::Credential, SensitivityTier::Restricted, &["password".into()])
    }

    #[test]
    fn append_links_events() {
        let chain = AuditChain::in_memory();
        let first = chain.append(event("a")).unwrap();
        let second = chain.append(event("b")).unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let events = chain.tail(10).unwrap();
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        assert_eq!(events[1].prev_hash, first.hash);
        assert_eq!(chain.last_hash().unwrap(), second.hash);
        assert!(chain.verify_chain().unwrap());
    }

    #[test]
    fn hash_covers_every_field() {
        let chain = AuditChain::in_memory();
        chain.append(event("a")).unwrap();
        let mut stored = chain.tail(1).unwrap().remove(0);

        let original = stored.compute_hash().unwrap();
        stored.detail = Some("edited".into());
        assert_ne!(stored.compute_hash().unwrap(), original);
    }

    #[test]
    fn tampered_sqlite_row_breaks_chain_at_that_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("audit.db");

        let chain = AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();
        for p in ["a", "b", "c", "d"] {
            chain.append(event(p)).unwrap();
        }
        assert!(chain.verify_chain().unwrap());

        let conn = Connection::open(&db).unwrap();
        conn.execute("UPDATE audit_log SET principal = 'x' WHERE sequence = 3", [])
            .unwrap();

        let report = chain.verify_report().unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_broken, Some(3));

        let last = chain.tail(1).unwrap().remove(0);
        assert_eq!(last.kind, AuditKind::Integrity);
        assert_eq!(last.severity, Severity::Critical);
    }

    #[test]
    fn sqlite_chain_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("audit.db");

        {
            let chain =
                AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();
            chain.append(event("a")).unwrap();
            chain.append(event("b")).unwrap();
        }

        let chain = AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();
        let next = chain.append(event("c")).unwrap();
        assert_eq!(next.sequence, 3);
        assert!(chain.verify_chain().unwrap());
    }

    #[test]
    fn jsonl_mirror_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonlMirror::open(dir.path().join("audit.jsonl")).unwrap();

        let mut e = event("a");
        e.sequence = 1;
        mirror.write_once(&e).unwrap();
        assert!(matches!(
            mirror.write_once(&e),
            Err(VaultError::MirrorWriteFailed { .. })
        ));
        assert_eq!(mirror.entries().unwrap().len(), 1);
    }

    #[test]
    fn mirror_matches_primary() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(
            Box::new(MemoryAuditSink::new()),
            Some(Box::new(JsonlMirror::open(dir.path().join("audit.jsonl")).unwrap())),
        )
        .unwrap();
        chain.append(event("a")).unwrap();
        chain.append(event("b")).unwrap();

        let report = chain.verify_report().unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 2);
        assert_eq!(report.mirror_divergence, None);
    }

    #[test]
    fn queries_filter_events() {
        let chain = AuditChain::in_memory();
        let early = Utc::now() - chrono::Duration::hours(2);
        chain.append(event("a").at(early)).unwrap();
        chain.append(event("b")).unwrap();
        chain.append(event("a")).unwrap();

        assert_eq!(chain.events_for("a").unwrap().len(), 2);
        assert_eq!(
            chain
                .events_since(Utc::now() - chrono::Duration::hours(1))
                .unwrap()
                .len(),
            2
        );
        let tail = chain.tail(2).unwrap();
        assert_eq!(tail[0].principal, "b");
        assert_eq!(chain.len().unwrap(), 3);
    }

    #[test]
    fn sqlite_queries_read_from_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("audit.db");
        let early = Utc::now() - chrono::Duration::hours(2);

        {
            let chain =
                AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();
            chain.append(event("a").at(early)).unwrap();
            chain.append(event("b")).unwrap();
            chain.append(event("a")).unwrap();
            chain.append(event("c")).unwrap();
        }

        // A fresh chain holds only the cursor; every query goes to disk.
        let chain = AuditChain::open(Box::new(SqliteAuditSink::open(&db).unwrap()), None).unwrap();
        assert_eq!(chain.len().unwrap(), 4);

        let recent = chain
            .events_since(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(
            recent.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );

        let for_a = chain.events_for("a").unwrap();
        assert_eq!(for_a.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 3]);

        let tail = chain.tail(2).unwrap();
        assert_eq!(tail[0].principal, "a");
        assert_eq!(tail[1].principal, "c");

        assert_eq!(chain.events_from(3).unwrap().len(), 2);
        assert!(chain.verify_chain().unwrap());
    }
}
