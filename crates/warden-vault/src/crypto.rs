//! Low-level cryptographic primitives built on the `ring` crate.
//!
//! This module provides the building blocks the envelope engine and the
//! audit chain are assembled from:
//!
//! - **AEAD**: AES-256-GCM sealing/opening with a detached 128-bit tag and
//!   caller-supplied additional authenticated data.
//! - **Keyed hashing**: HMAC-SHA256 over length-prefixed parts, used for
//!   deterministic nonces, per-key KEK derivation and tokenization.
//! - **Digests**: SHA-256 for the audit chain and identity fingerprints.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 for the file keychain.
//! - **Random generation**: cryptographically secure random bytes.
//!
//! # Security Notes
//!
//! - Every failure on the opening path is collapsed into
//!   [`VaultError::DecryptionFailed`] with no detail.
//! - Randomized nonces are 96-bit; the collision probability is negligible
//!   for up to ~2^32 seals under the same data key, and every envelope gets
//!   its own data key anyway.

use ring::aead::{
    self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey,
};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the AES-256-GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count, 600,000 per the OWASP 2023 recommendation for
/// HMAC-SHA256.
const PBKDF2_ITERATIONS: u32 = 600_000;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Every seal
/// and open in this crate binds a fresh key object to exactly one nonce.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// AEAD
// ---------------------------------------------------------------------------

/// Seal `plaintext` under `key` with the given `nonce` and `aad`.
///
/// Returns `(ciphertext, tag)` with the tag detached so that envelopes can
/// carry it as an explicit field.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the key length is wrong or
/// `ring` reports a failure.
pub fn seal(
    key: &[u8],
    nonce: [u8; NONCE_LEN_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN])> {
    if key.len() != KEY_LEN {
        return Err(VaultError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = plaintext.to_vec();
    let tag = sealing_key
        .seal_in_place_separate_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "sealed data"
    );

    Ok((in_out, tag_bytes))
}

/// Open `ciphertext` with its detached `tag`.
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] for every failure: wrong key
/// length, wrong key, wrong nonce, wrong AAD or tampered bytes.
pub fn open(
    key: &[u8],
    nonce: [u8; NONCE_LEN_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(VaultError::DecryptionFailed);
    }

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::DecryptionFailed)?;
    let mut opening_key = OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::DecryptionFailed)?;

    Ok(plaintext.to_vec())
}

/// Encrypt with a random nonce, returning `(nonce, ciphertext || tag)`.
///
/// Compact single-blob form used for small key material (wrapped data keys,
/// the keychain file).
pub fn encrypt(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    let nonce = random_nonce()?;
    let (mut ciphertext, tag) = seal(key, nonce, aad, plaintext)?;
    ciphertext.extend_from_slice(&tag);
    Ok((nonce, ciphertext))
}

/// Inverse of [`encrypt`].
pub fn decrypt(
    nonce: &[u8; NONCE_LEN_BYTES],
    ciphertext_and_tag: &[u8],
    key: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext_and_tag.len() < TAG_LEN {
        return Err(VaultError::DecryptionFailed);
    }
    let (ciphertext, tag_slice) = ciphertext_and_tag.split_at(ciphertext_and_tag.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(tag_slice);
    open(key, *nonce, aad, ciphertext, &tag)
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// HMAC-SHA256 over `parts`, each prefixed with its big-endian length so
/// that `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut ctx = hmac::Context::with_key(&key);
    for part in parts {
        ctx.update(&(part.len() as u64).to_be_bytes());
        ctx.update(part);
    }
    let tag = ctx.sign();
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 digest of `data`, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(&sha256(data))
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `password` and a known `salt` via PBKDF2.
pub fn derive_key_with_salt(password: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    let iterations =
        std::num::NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, password, out);
}

// ---------------------------------------------------------------------------
// Random bytes
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

/// Generate a fresh random 256-bit key.
pub fn random_key() -> Result<[u8; KEY_LEN]> {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LEN];
    rng.fill(&mut key)
        .map_err(|_| VaultError::Internal("failed to generate random key".into()))?;
    Ok(key)
}

/// Generate a fresh random 96-bit nonce.
pub fn random_nonce() -> Result<[u8; NONCE_LEN_BYTES]> {
    let rng = SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    rng.fill(&mut nonce)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;
    Ok(nonce)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
