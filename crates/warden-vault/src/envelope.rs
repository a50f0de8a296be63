//! Envelope encryption engine.
//!
//! Every secret is sealed under its own data-encryption key (DEK); the DEK
//! is wrapped under a key-encryption key (KEK) fetched from the key
//! authority. The resulting [`Envelope`] is self-describing: it names the
//! algorithm, mode, KEK id, nonce and detached authentication tag, so it can
//! be decrypted or re-wrapped without out-of-band metadata.
//!
//! # Modes
//!
//! - [`EncryptionMode::Randomized`] (default): random DEK, random nonce.
//!   Equal plaintexts produce unrelated envelopes.
//! - [`EncryptionMode::Deterministic`]: the DEK is derived from the KEK and
//!   the field context, and the nonce from a keyed hash of the plaintext and
//!   context. Equal plaintexts in the same context under the same KEK
//!   produce equal ciphertexts, which enables equality lookup at a
//!   confidentiality cost. Refused for tiers above
//!   [`SensitivityTier::Sensitive`].
//!
//! # Layout
//!
//! ```text
//! data AAD    = "warden-env-v1" | mode | caller AAD
//! wrapped_key = wrap_nonce(12) || AES-GCM(KEK, DEK, aad = key_id) || tag(16)
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::{self, KEY_LEN, NONCE_LEN_BYTES, TAG_LEN};
use crate::error::{Result, VaultError};
use crate::keys::{ALGORITHM_AES_256_GCM, KeyCache, KeyMaterial};
use crate::types::SensitivityTier;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

const DATA_AAD_PREFIX: &[u8] = b"warden-env-v1";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Nonce derivation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    #[default]
    Randomized,
    Deterministic,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Randomized => "randomized",
            Self::Deterministic => "deterministic",
        }
    }
}

/// Self-describing ciphertext.
///
/// Byte fields serialize as standard base64 so envelopes can be stored as
/// JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub algorithm: String,
    pub mode: EncryptionMode,
    pub key_id: String,
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Equality-lookup fingerprint over nonce, ciphertext and tag.
    ///
    /// Only meaningful for deterministic envelopes; randomized envelopes of
    /// the same plaintext never share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut buf = Vec::with_capacity(self.nonce.len() + self.ciphertext.len() + self.tag.len());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        buf.extend_from_slice(&self.tag);
        crypto::sha256_hex(&buf)
    }

    fn nonce_array(&self) -> Result<[u8; NONCE_LEN_BYTES]> {
        self.nonce
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::DecryptionFailed)
    }

    fn tag_array(&self) -> Result<[u8; TAG_LEN]> {
        self.tag
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::DecryptionFailed)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Encrypts, decrypts and re-wraps envelopes using KEKs from a [`KeyCache`].
#[derive(Clone)]
pub struct EnvelopeEngine {
    keys: KeyCache,
}

impl EnvelopeEngine {
    pub fn new(keys: KeyCache) -> Self {
        Self { keys }
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    /// Encrypt in randomized mode.
    ///
    /// # Errors
    ///
    /// - [`VaultError::KeyUnavailable`] if the key authority timed out.
    /// - [`VaultError::KeyDeprecated`] / [`VaultError::KeyRevoked`] if the
    ///   key may not encrypt new data.
    pub async fn encrypt(&self, plaintext: &[u8], key_id: &str, aad: Option<&[u8]>) -> Result<Envelope> {
        let kek = self.encryption_key(key_id).await?;
        let dek = crypto::random_key()?;
        let nonce = crypto::random_nonce()?;
        self.seal(&kek, EncryptionMode::Randomized, dek, nonce, plaintext, aad)
    }

    /// Encrypt in deterministic mode, with `context` naming the field.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DeterministicForbidden`] if `tier` is above
    /// [`SensitivityTier::Sensitive`], before any key is fetched.
    pub async fn encrypt_deterministic(
        &self,
        plaintext: &[u8],
        key_id: &str,
        context: &[u8],
        tier: SensitivityTier,
    ) -> Result<Envelope> {
        if !tier.allows_deterministic() {
            tracing::warn!(key_id = key_id, tier = %tier, "deterministic encryption refused");
            return Err(VaultError::DeterministicForbidden { tier });
        }
        let kek = self.encryption_key(key_id).await?;
        self.seal_deterministic(&kek, plaintext, context)
    }

    /// Decrypt an envelope.
    ///
    /// Key-fetch failures keep their own variants; every cryptographic or
    /// structural failure is [`VaultError::DecryptionFailed`].
    pub async fn decrypt(&self, envelope: &Envelope, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION || envelope.algorithm != ALGORITHM_AES_256_GCM {
            return Err(VaultError::DecryptionFailed);
        }
        let kek = self.decryption_key(&envelope.key_id).await?;
        let dek = unwrap_dek(&kek, &envelope.wrapped_key)?;

        let data_aad = data_aad(envelope.mode, aad);
        let plaintext = crypto::open(
            &dek,
            envelope.nonce_array()?,
            &data_aad,
            &envelope.ciphertext,
            &envelope.tag_array()?,
        )?;

        tracing::trace!(key_id = %envelope.key_id, mode = envelope.mode.as_str(), "envelope decrypted");
        Ok(plaintext)
    }

    /// Move an envelope under `new_key_id`.
    ///
    /// Randomized envelopes are re-wrapped: the DEK is unwrapped with the old
    /// KEK and wrapped with the new one, the data ciphertext is untouched.
    /// Deterministic envelopes are re-encrypted because their DEK is bound to
    /// the KEK; `aad` must then be the original field context.
    pub async fn rotate_key(
        &self,
        envelope: &Envelope,
        new_key_id: &str,
        aad: Option<&[u8]>,
    ) -> Result<Envelope> {
        let new_kek = self.encryption_key(new_key_id).await?;

        let rotated = match envelope.mode {
            EncryptionMode::Randomized => {
                let old_kek = self.decryption_key(&envelope.key_id).await?;
                let dek = unwrap_dek(&old_kek, &envelope.wrapped_key)?;
                Envelope {
                    key_id: new_key_id.to_string(),
                    wrapped_key: wrap_dek(&new_kek, &dek)?,
                    ..envelope.clone()
                }
            }
            EncryptionMode::Deterministic => {
                let plaintext = self.decrypt(envelope, aad).await?;
                self.seal_deterministic(&new_kek, &plaintext, aad.unwrap_or_default())?
            }
        };

        tracing::info!(
            from = %envelope.key_id,
            to = new_key_id,
            mode = envelope.mode.as_str(),
            "envelope rotated"
        );
        Ok(rotated)
    }

    /// Stable surrogate for `plaintext` under `key_id`.
    ///
    /// The same `(key_id, context, plaintext)` always yields the same token;
    /// the token reveals nothing without the KEK.
    pub async fn tokenize(&self, key_id: &str, context: &[u8], plaintext: &[u8]) -> Result<String> {
        let kek = self.decryption_key(key_id).await?;
        let mac = crypto::hmac_sha256(kek.bytes(), &[b"warden-token-v1", context, plaintext]);
        Ok(format!("tok_{}", &crypto::to_hex(&mac)[..32]))
    }

    // -- Internal helpers ---------------------------------------------------

    async fn encryption_key(&self, key_id: &str) -> Result<KeyMaterial> {
        let kek = self.keys.get(key_id).await?;
        if !kek.status().can_encrypt() {
            return Err(if kek.status().can_decrypt() {
                VaultError::KeyDeprecated {
                    key_id: key_id.to_string(),
                }
            } else {
                VaultError::KeyRevoked {
                    key_id: key_id.to_string(),
                }
            });
        }
        Ok(kek)
    }

    async fn decryption_key(&self, key_id: &str) -> Result<KeyMaterial> {
        let kek = self.keys.get(key_id).await?;
        if !kek.status().can_decrypt() {
            return Err(VaultError::KeyRevoked {
                key_id: key_id.to_string(),
            });
        }
        Ok(kek)
    }

    fn seal_deterministic(&self, kek: &KeyMaterial, plaintext: &[u8], context: &[u8]) -> Result<Envelope> {
        let dek = crypto::hmac_sha256(kek.bytes(), &[b"warden-det-dek-v1", context]);
        let digest = crypto::hmac_sha256(&dek, &[b"warden-det-nonce-v1", context, plaintext]);
        let mut nonce = [0u8; NONCE_LEN_BYTES];
        nonce.copy_from_slice(&digest[..NONCE_LEN_BYTES]);
        self.seal(kek, EncryptionMode::Deterministic, dek, nonce, plaintext, Some(context))
    }

    fn seal(
        &self,
        kek: &KeyMaterial,
        mode: EncryptionMode,
        dek: [u8; KEY_LEN],
        nonce: [u8; NONCE_LEN_BYTES],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<Envelope> {
        let (ciphertext, tag) = crypto::seal(&dek, nonce, &data_aad(mode, aad), plaintext)?;

        tracing::trace!(key_id = kek.key_id(), mode = mode.as_str(), "envelope sealed");

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM_AES_256_GCM.to_string(),
            mode,
            key_id: kek.key_id().to_string(),
            wrapped_key: wrap_dek(kek, &dek)?,
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
            ciphertext,
        })
    }
}

fn data_aad(mode: EncryptionMode, aad: Option<&[u8]>) -> Vec<u8> {
    let aad = aad.unwrap_or_default();
    let mut out = Vec::with_capacity(DATA_AAD_PREFIX.len() + 16 + aad.len());
    out.extend_from_slice(DATA_AAD_PREFIX);
    out.push(b'|');
    out.extend_from_slice(mode.as_str().as_bytes());
    out.push(b'|');
    out.extend_from_slice(aad);
    out
}

fn wrap_dek(kek: &KeyMaterial, dek: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
    let (nonce, sealed) = crypto::encrypt(dek, kek.bytes(), kek.key_id().as_bytes())?;
    let mut out = Vec::with_capacity(NONCE_LEN_BYTES + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn unwrap_dek(kek: &KeyMaterial, wrapped: &[u8]) -> Result<[u8; KEY_LEN]> {
    if wrapped.len() != NONCE_LEN_BYTES + KEY_LEN + TAG_LEN {
        return Err(VaultError::DecryptionFailed);
    }
    let (nonce_bytes, sealed) = wrapped.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_bytes);

    let dek = crypto::decrypt(&nonce, sealed, kek.bytes(), kek.key_id().as_bytes())?;
    dek.as_slice()
        .try_into()
        .map_err(|_| VaultError::DecryptionFailed)
}

/// Serde adapter: `Vec<u8>` as standard base64.
mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
