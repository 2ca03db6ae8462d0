pub mod aes_gcm;
pub mod key;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::error::{Result, StrataError};
use strata_types::ContentId;

pub use self::aes_gcm::Aes256GcmEngine;

/// Trait for encrypting and decrypting repository objects.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`. `aad` must match.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;

    /// The key used for computing content IDs (keyed BLAKE2b-256).
    fn content_id_key(&self) -> &[u8; 32];

    /// Identifier of the encryption key, recorded in every index entry.
    /// `0` means the payload is not encrypted.
    fn key_id(&self) -> u32;

    /// Algorithm name recorded in the format blob.
    fn algorithm(&self) -> &'static str;

    fn content_id(&self, prefix: Option<char>, data: &[u8]) -> Result<ContentId> {
        ContentId::compute(self.content_id_key(), prefix, data)
    }
}

/// No-encryption engine. Still computes keyed content IDs.
pub struct PlaintextEngine {
    content_id_key: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(content_id_key: &[u8; 32]) -> Self {
        Self {
            content_id_key: *content_id_key,
        }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn content_id_key(&self) -> &[u8; 32] {
        &self.content_id_key
    }

    fn key_id(&self) -> u32 {
        0
    }

    fn algorithm(&self) -> &'static str {
        "none"
    }
}

/// Encryption mode selected at `init` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    None,
    Aes256Gcm,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Aes256Gcm => "aes256gcm",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(EncryptionMode::None),
            "aes256gcm" => Ok(EncryptionMode::Aes256Gcm),
            other => Err(StrataError::Config(format!(
                "unknown encryption mode: {other}"
            ))),
        }
    }
}

/// Derive a stable non-zero key ID from encryption key material.
pub(crate) fn derive_key_id(key: &[u8; 32]) -> u32 {
    let digest = Blake2b::<U32>::new()
        .chain_update(b"strata:key-id\0")
        .chain_update(key)
        .finalize();
    let id = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    id.max(1)
}
