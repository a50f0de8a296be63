//! Master key storage for the local key authority.
//!
//! The master key from which [`LocalKeyAuthority`](crate::keys::LocalKeyAuthority)
//! derives every KEK must never sit on disk in plaintext. A
//! [`KeychainProvider`] abstracts over where it lives:
//!
//! - [`FileKeychain`]: the key encrypted under a device-derived key
//!   (PBKDF2 over hostname + user + a per-file random salt).
//! - [`MemoryKeychain`]: process memory only, for tests and ephemeral
//!   deployments. A restart loses every key, which is fail-closed.
//!
//! # File layout
//!
//! ```text
//! [32 bytes: PBKDF2 salt]
//! [12 bytes: AES-256-GCM nonce]
//! [remaining: AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The file is created with mode 0600 on Unix.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto;
use crate::error::{Result, VaultError};

/// AAD bound into the keychain file so the blob cannot be confused with any
/// other ciphertext produced under the same device key.
const KEYCHAIN_AAD: &[u8] = b"warden-keychain-v1";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over secure master key storage.
pub trait KeychainProvider: Send + Sync {
    /// Retrieve the master key.
    ///
    /// Returns [`VaultError::MasterKeyNotFound`] if no key has been stored yet.
    fn get_master_key(&self) -> Result<Vec<u8>>;

    /// Store (or overwrite) the master key.
    fn set_master_key(&self, key: &[u8]) -> Result<()>;

    /// Check whether a master key has been stored.
    fn has_master_key(&self) -> Result<bool>;

    /// Delete the stored master key.
    fn delete_master_key(&self) -> Result<()>;
}

/// Load the master key, generating and storing a fresh one on first use.
pub fn load_or_init_master_key(provider: &dyn KeychainProvider) -> Result<Vec<u8>> {
    match provider.get_master_key() {
        Ok(key) => Ok(key),
        Err(VaultError::MasterKeyNotFound) => {
            let key = crypto::random_key()?.to_vec();
            provider.set_master_key(&key)?;
            tracing::info!("generated new master key");
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// File-based keychain
// ---------------------------------------------------------------------------

/// File-based keychain storing the master key encrypted with a
/// device-derived key.
pub struct FileKeychain {
    key_file: PathBuf,
}

impl FileKeychain {
    /// Create a keychain that stores the key at `key_file`.
    ///
    /// The file is created on
    /// [`set_master_key`](KeychainProvider::set_master_key).
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    /// Default key file location: `<data_dir>/master.key`.
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("master.key")
    }

    pub fn path(&self) -> &Path {
        &self.key_file
    }

    fn device_derived_key(salt: &[u8]) -> [u8; crypto::KEY_LEN] {
        let hostname = Self::get_hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material = Vec::with_capacity(hostname.len() + username.len() + 1);
        material.extend_from_slice(hostname.as_bytes());
        material.push(0);
        material.extend_from_slice(username.as_bytes());

        let mut key = [0u8; crypto::KEY_LEN];
        crypto::derive_key_with_salt(&material, salt, &mut key);
        key
    }

    fn get_hostname() -> String {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .or_else(|_| std::env::var("HOSTNAME"))
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown-host".into())
        }

        #[cfg(not(unix))]
        {
            std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into())
        }
    }
}

impl KeychainProvider for FileKeychain {
    fn get_master_key(&self) -> Result<Vec<u8>> {
        if !self.key_file.exists() {
            return Err(VaultError::MasterKeyNotFound);
        }

        let data = std::fs::read(&self.key_file)?;

        // salt (32) + nonce (12) + tag (16)
        if data.len() < crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + crypto::TAG_LEN {
            return Err(VaultError::DecryptionFailed);
        }

        let (salt, rest) = data.split_at(crypto::SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(crypto::NONCE_LEN_BYTES);

        let mut nonce = [0u8; crypto::NONCE_LEN_BYTES];
        nonce.copy_from_slice(nonce_bytes);

        let device_key = Self::device_derived_key(salt);
        let master_key = crypto::decrypt(&nonce, ciphertext, &device_key, KEYCHAIN_AAD)?;

        tracing::debug!("retrieved master key from file keychain");
        Ok(master_key)
    }

    fn set_master_key(&self, key: &[u8]) -> Result<()> {
        let salt = crypto::random_bytes(crypto::SALT_LEN)?;
        let device_key = Self::device_derived_key(&salt);
        let (nonce, ciphertext) = crypto::encrypt(key, &device_key, KEYCHAIN_AAD)?;

        let mut data =
            Vec::with_capacity(crypto::SALT_LEN + crypto::NONCE_LEN_BYTES + ciphertext.len());
        data.extend_from_slice(&salt);
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&ciphertext);

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.key_file, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.key_file, perms)?;
        }

        tracing::info!(path = %self.key_file.display(), "stored master key in file keychain");
        Ok(())
    }

    fn has_master_key(&self) -> Result<bool> {
        Ok(self.key_file.exists())
    }

    fn delete_master_key(&self) -> Result<()> {
        if self.key_file.exists() {
            std::fs::remove_file(&self.key_file)?;
            tracing::info!(path = %self.key_file.display(), "deleted master key from file keychain");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory keychain
// ---------------------------------------------------------------------------

/// Process-local keychain. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryKeychain {
    key: Mutex<Option<Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<u8>>>> {
        self.key
            .lock()
            .map_err(|e| VaultError::Internal(format!("keychain mutex poisoned: {e}")))
    }
}

impl KeychainProvider for MemoryKeychain {
    fn get_master_key(&self) -> Result<Vec<u8>> {
        self.lock()?.clone().ok_or(VaultError::MasterKeyNotFound)
    }

    fn set_master_key(&self, key: &[u8]) -> Result<()> {
        *self.lock()? = Some(key.to_vec());
        Ok(())
    }

    fn has_master_key(&self) -> Result<bool> {
        Ok(self.lock()?.is_some())
    }

    fn delete_master_key(&self) -> Result<()> {
        *self.lock()? = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
