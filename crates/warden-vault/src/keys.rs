//! Key authority seam and the short-lived key cache.
//!
//! Key-encryption keys (KEKs) never live in the secret store. They are
//! fetched on demand from a [`KeyAuthority`] and cached for a bounded TTL
//! (five minutes by default) so that a leaked process image exposes as few
//! keys as possible.
//!
//! - [`LocalKeyAuthority`] is the in-process authority: it derives one KEK
//!   per key id from a master key and tracks the key status lifecycle.
//! - [`KeyCache`] wraps any authority with a `moka` TTL cache and a bounded
//!   fetch timeout. A timeout surfaces as the retryable
//!   [`VaultError::KeyUnavailable`], never as a denial.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN};
use crate::error::{Result, VaultError};

/// Default time-to-live for cached key material.
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default upper bound on a single key-authority call.
pub const DEFAULT_KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Algorithm label recorded on keys and envelopes.
pub const ALGORITHM_AES_256_GCM: &str = "AES-256-GCM";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of an encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Current key for new encryptions.
    Active,
    /// Being rotated away from; existing data is being rewrapped.
    Rotating,
    /// Decrypts existing data, never encrypts new data.
    Deprecated,
    /// Unusable.
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Deprecated => "deprecated",
            Self::Revoked => "revoked",
        }
    }

    pub fn can_encrypt(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn can_decrypt(&self) -> bool {
        !matches!(self, Self::Revoked)
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a key known to the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub id: String,
    pub algorithm: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
}

/// Key material handed out by a [`KeyAuthority`].
///
/// The raw bytes are reference counted so cache clones never copy them, and
/// `Debug` never prints them.
#[derive(Clone)]
pub struct KeyMaterial {
    key_id: String,
    status: KeyStatus,
    bytes: Arc<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    pub fn new(key_id: impl Into<String>, status: KeyStatus, bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key_id: key_id.into(),
            status,
            bytes: Arc::new(bytes),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("status", &self.status)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// External authority that owns key-encryption keys.
#[async_trait]
pub trait KeyAuthority: Send + Sync {
    /// Fetch the key material for `key_id`.
    ///
    /// Implementations return [`VaultError::UnknownKey`] for ids they have
    /// never issued and [`VaultError::KeyRevoked`] for revoked keys.
    async fn generate_data_key(&self, key_id: &str) -> Result<KeyMaterial>;
}

// ---------------------------------------------------------------------------
// Local authority
// ---------------------------------------------------------------------------

/// In-process key authority deriving per-key KEKs from a master key.
///
/// KEK = HMAC-SHA256(master, "warden-kek-v1" || key_id). The master key is
/// typically loaded through a [`KeychainProvider`](crate::keychain::KeychainProvider).
pub struct LocalKeyAuthority {
    master_key: [u8; KEY_LEN],
    keys: DashMap<String, EncryptionKey>,
}

impl LocalKeyAuthority {
    /// Create an authority over `master_key`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyDerivationFailed`] if the master key is not
    /// exactly [`KEY_LEN`] bytes.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() != KEY_LEN {
            return Err(VaultError::KeyDerivationFailed {
                reason: format!("master key must be {} bytes, got {}", KEY_LEN, master_key.len()),
            });
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(master_key);
        Ok(Self {
            master_key: key,
            keys: DashMap::new(),
        })
    }

    /// Register a new active key. Re-registering an existing id is a no-op.
    pub fn register(&self, key_id: &str) -> EncryptionKey {
        let entry = self
            .keys
            .entry(key_id.to_string())
            .or_insert_with(|| {
                tracing::info!(key_id = key_id, "registered encryption key");
                EncryptionKey {
                    id: key_id.to_string(),
                    algorithm: ALGORITHM_AES_256_GCM.to_string(),
                    status: KeyStatus::Active,
                    created_at: Utc::now(),
                }
            });
        entry.value().clone()
    }

    /// Move a key to `status`.
    ///
    /// Revocation is terminal: a revoked key cannot be reactivated.
    pub fn set_status(&self, key_id: &str, status: KeyStatus) -> Result<()> {
        let mut entry = self
            .keys
            .get_mut(key_id)
            .ok_or_else(|| VaultError::UnknownKey {
                key_id: key_id.to_string(),
            })?;

        if entry.status == KeyStatus::Revoked && status != KeyStatus::Revoked {
            return Err(VaultError::KeyRevoked {
                key_id: key_id.to_string(),
            });
        }

        let old = entry.status;
        entry.status = status;
        tracing::info!(key_id = key_id, from = %old, to = %status, "key status changed");
        Ok(())
    }

    pub fn begin_rotation(&self, key_id: &str) -> Result<()> {
        self.set_status(key_id, KeyStatus::Rotating)
    }

    /// Deprecated keys still decrypt but never encrypt new data.
    pub fn deprecate(&self, key_id: &str) -> Result<()> {
        self.set_status(key_id, KeyStatus::Deprecated)
    }

    pub fn revoke(&self, key_id: &str) -> Result<()> {
        self.set_status(key_id, KeyStatus::Revoked)
    }

    /// Snapshot of a key's metadata.
    pub fn key(&self, key_id: &str) -> Option<EncryptionKey> {
        self.keys.get(key_id).map(|e| e.value().clone())
    }

    /// All known keys, sorted by id.
    pub fn list(&self) -> Vec<EncryptionKey> {
        let mut keys: Vec<EncryptionKey> = self.keys.iter().map(|e| e.value().clone()).collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        keys
    }

    fn derive(&self, key_id: &str) -> [u8; KEY_LEN] {
        crypto::hmac_sha256(&self.master_key, &[b"warden-kek-v1", key_id.as_bytes()])
    }
}

#[async_trait]
impl KeyAuthority for LocalKeyAuthority {
    async fn generate_data_key(&self, key_id: &str) -> Result<KeyMaterial> {
        let status = self
            .keys
            .get(key_id)
            .map(|e| e.status)
            .ok_or_else(|| VaultError::UnknownKey {
                key_id: key_id.to_string(),
            })?;

        if status == KeyStatus::Revoked {
            return Err(VaultError::KeyRevoked {
                key_id: key_id.to_string(),
            });
        }

        Ok(KeyMaterial::new(key_id, status, self.derive(key_id)))
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Counters tracking key cache effectiveness.
#[derive(Debug, Default)]
pub struct KeyCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
}

impl KeyCacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

impl fmt::Display for KeyCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} timeouts={}",
            self.hits(),
            self.misses(),
            self.timeouts()
        )
    }
}

/// TTL cache in front of a [`KeyAuthority`] with a bounded fetch timeout.
#[derive(Clone)]
pub struct KeyCache {
    authority: Arc<dyn KeyAuthority>,
    inner: Cache<String, KeyMaterial>,
    fetch_timeout: Duration,
    stats: Arc<KeyCacheStats>,
}

impl KeyCache {
    /// Create a cache with the default TTL and timeout.
    pub fn new(authority: Arc<dyn KeyAuthority>) -> Self {
        Self::with_settings(authority, DEFAULT_KEY_CACHE_TTL, DEFAULT_KEY_FETCH_TIMEOUT)
    }

    pub fn with_settings(
        authority: Arc<dyn KeyAuthority>,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        let inner = Cache::builder()
            .max_capacity(1_024)
            .time_to_live(ttl)
            .build();
        Self {
            authority,
            inner,
            fetch_timeout,
            stats: Arc::new(KeyCacheStats::default()),
        }
    }

    /// Resolve key material, consulting the authority on a miss.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyUnavailable`] if the authority does not answer
    ///   within the fetch timeout.
    /// - Any error returned by the authority itself.
    pub async fn get(&self, key_id: &str) -> Result<KeyMaterial> {
        if let Some(material) = self.inner.get(key_id).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key_id = key_id, "key cache hit");
            return Ok(material);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let fetched =
            tokio::time::timeout(self.fetch_timeout, self.authority.generate_data_key(key_id))
                .await;

        let material = match fetched {
            Ok(result) => result?,
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key_id = key_id,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "key authority timed out"
                );
                return Err(VaultError::KeyUnavailable {
                    key_id: key_id.to_string(),
                });
            }
        };

        self.inner
            .insert(key_id.to_string(), material.clone())
            .await;
        tracing::debug!(key_id = key_id, "key cached");
        Ok(material)
    }

    /// Drop any cached material for `key_id` (after a status change).
    pub async fn invalidate(&self, key_id: &str) {
        self.inner.invalidate(key_id).await;
        tracing::debug!(key_id = key_id, "key cache invalidate");
    }

    pub fn stats(&self) -> &KeyCacheStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowAuthority;

    #[async_trait]
    impl KeyAuthority for SlowAuthority {
        async fn generate_data_key(&self, key_id: &str) -> Result<KeyMaterial> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(KeyMaterial::new(key_id, KeyStatus::Active, [0u8; KEY_LEN]))
        }
    }

    fn authority() -> Arc<LocalKeyAuthority> {
        let master = crypto::random_key().unwrap();
        Arc::new(LocalKeyAuthority::new(&master).unwrap())
    }

    #[tokio::test]
    async fn derives_stable_distinct_keys() {
        let auth = authority();
        auth.register("k1");
        auth.register("k2");

        let a = auth.generate_data_key("k1").await.unwrap();
        let b = auth.generate_data_key("k1").await.unwrap();
        let c = auth.generate_data_key("k2").await.unwrap();

        assert_eq!(a.bytes(), b.bytes());
        assert_ne!(a.bytes(), c.bytes());
    }

    #[tokio::test]
    async fn unknown_and_revoked_keys_rejected() {
        let auth = authority();
        assert!(matches!(
            auth.generate_data_key("nope").await,
            Err(VaultError::UnknownKey { .. })
        ));

        auth.register("k1");
        auth.set_status("k1", KeyStatus::Revoked).unwrap();
        assert!(matches!(
            auth.generate_data_key("k1").await,
            Err(VaultError::KeyRevoked { .. })
        ));
        assert!(auth.set_status("k1", KeyStatus::Active).is_err());
    }

    #[tokio::test]
    async fn cache_hits_after_first_fetch() {
        let auth = authority();
        auth.register("k1");
        let cache = KeyCache::new(auth);

        cache.get("k1").await.unwrap();
        cache.get("k1").await.unwrap();

        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn timeout_is_key_unavailable_and_retryable() {
        let cache = KeyCache::with_settings(
            Arc::new(SlowAuthority),
            DEFAULT_KEY_CACHE_TTL,
            Duration::from_millis(20),
        );

        let err = cache.get("k1").await.unwrap_err();
        assert!(matches!(err, VaultError::KeyUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(cache.stats().timeouts(), 1);
    }

    #[test]
    fn debug_output_redacts_bytes() {
        let m = KeyMaterial::new("k1", KeyStatus::Active, [9u8; KEY_LEN]);
        let s = format!("{m:?}");
        assert!(s.contains("redacted"));
        assert!(!s.contains("9, 9"));
    }

    #[test]
    fn status_capabilities() {
        assert!(KeyStatus::Active.can_encrypt());
        assert!(!KeyStatus::Deprecated.can_encrypt());
        assert!(KeyStatus::Deprecated.can_decrypt());
        assert!(!KeyStatus::Revoked.can_decrypt());
    }
}
