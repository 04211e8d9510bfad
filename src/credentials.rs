//! Credential material: key generation, encoding, keyID derivation and
//! salted digests.
//!
//! A key is `KEY_ID_SIZE` public bytes followed by `KEY_PAYLOAD_SIZE`
//! private bytes. Only the keyID and a salted SHA-384 digest of the payload
//! are ever persisted.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha384};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

use crate::models::token::{Token, TokenId};

/// Public part of a key, used for lookup.
pub const KEY_ID_SIZE: usize = 8;

/// Private part of a key.
pub const KEY_PAYLOAD_SIZE: usize = 32;

pub const KEY_SIZE: usize = KEY_ID_SIZE + KEY_PAYLOAD_SIZE;

const SALT_SIZE: usize = 16;
const HASH_SIZE: usize = 48;

/// Serialized size of a [`StoredDigest`].
pub const DIGEST_SIZE: usize = SALT_SIZE + HASH_SIZE;

/// Number of keyID hex characters shown as a token hint.
pub const HINT_CHARS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential encoding is invalid")]
    InvalidEncoding,

    #[error("credential has wrong length")]
    InvalidLength,

    #[error("key id is invalid")]
    InvalidKeyId,

    #[error("stored digest is corrupt")]
    CorruptDigest,
}

// ── KeyId ────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_SIZE]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; KEY_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_ID_SIZE] {
        &self.0
    }

    /// Short non-secret prefix for logs and response headers.
    pub fn hint(&self) -> String {
        let mut hex = self.to_string();
        hex.truncate(HINT_CHARS);
        hex
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

impl FromStr for KeyId {
    type Err = CredentialError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0_u8; KEY_ID_SIZE];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| CredentialError::InvalidKeyId)?;
        Ok(Self(bytes))
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Secret ───────────────────────────────────────────────────

/// Full key material. Zeroized on drop, redacted in `Debug`.
#[derive(Clone)]
pub struct Secret {
    bytes: [u8; KEY_SIZE],
}

impl Secret {
    pub fn generate() -> Self {
        let mut bytes = [0_u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse the client-facing string form.
    pub fn parse(value: &str) -> Result<Self, CredentialError> {
        let mut decoded = URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|_| CredentialError::InvalidEncoding)?;
        if decoded.len() != KEY_SIZE {
            decoded.zeroize();
            return Err(CredentialError::InvalidLength);
        }
        let mut bytes = [0_u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Client-facing string form. Returned to the owner exactly once.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.bytes)
    }

    pub fn key_id(&self) -> KeyId {
        let mut id = [0_u8; KEY_ID_SIZE];
        id.copy_from_slice(&self.bytes[..KEY_ID_SIZE]);
        KeyId(id)
    }

    fn payload(&self) -> &[u8] {
        &self.bytes[KEY_ID_SIZE..]
    }

    /// Fresh salted digest of this secret.
    pub fn digest(&self) -> StoredDigest {
        let mut salt = [0_u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        StoredDigest {
            salt,
            hash: salted_hash(&salt, self.payload()),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**redacted**)")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// ── StoredDigest ─────────────────────────────────────────────

/// Salted one-way representation of a secret, safe to persist.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredDigest {
    salt: [u8; SALT_SIZE],
    hash: [u8; HASH_SIZE],
}

impl StoredDigest {
    /// Constant-time check of `secret` against this digest.
    pub fn verify(&self, secret: &Secret) -> bool {
        let candidate = salted_hash(&self.salt, secret.payload());
        candidate.ct_eq(&self.hash).into()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DIGEST_SIZE);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, CredentialError> {
        if raw.len() != DIGEST_SIZE {
            return Err(CredentialError::CorruptDigest);
        }
        let (salt_raw, hash_raw) = raw.split_at(SALT_SIZE);
        let mut salt = [0_u8; SALT_SIZE];
        let mut hash = [0_u8; HASH_SIZE];
        salt.copy_from_slice(salt_raw);
        hash.copy_from_slice(hash_raw);
        Ok(Self { salt, hash })
    }
}

impl fmt::Debug for StoredDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoredDigest(..)")
    }
}

fn salted_hash(salt: &[u8; SALT_SIZE], payload: &[u8]) -> [u8; HASH_SIZE] {
    let digest = Sha384::new()
        .chain_update(salt)
        .chain_update(payload)
        .finalize();
    let mut out = [0_u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    out
}

// ── Issuer ───────────────────────────────────────────────────

/// What the store persists for a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key_id: KeyId,
    pub digest: StoredDigest,
}

/// Generate a brand new credential.
///
/// keyID uniqueness is enforced by the store; callers retry on conflict.
pub fn mint() -> (Secret, KeyMaterial) {
    let secret = Secret::generate();
    let material = KeyMaterial {
        key_id: secret.key_id(),
        digest: secret.digest(),
    };
    (secret, material)
}

/// Generate a replacement credential for `token`, never reusing its keyID.
pub fn rotate(token: &Token) -> (Secret, KeyMaterial) {
    loop {
        let (secret, material) = mint();
        if material.key_id != token.key_id {
            return (secret, material);
        }
    }
}

/// One-time credential delivery payload.
#[derive(Clone, Serialize)]
pub struct Credential {
    pub id: TokenId,
    pub key: String,
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("key", &"**redacted**")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl Credential {
    pub fn new(id: TokenId, secret: &Secret) -> Self {
        Self {
            id,
            key: secret.encode(),
            key_id: secret.key_id(),
        }
    }
}
