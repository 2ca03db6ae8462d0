use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{Aes256GcmEngine, CryptoEngine, EncryptionMode, PlaintextEngine};
use crate::error::{Result, StrataError};

/// The master key material, never stored in plaintext when encryption is on.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
    pub content_id_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
    content_id_key: Vec<u8>,
}

/// KDF parameters stored alongside the encrypted key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

/// On-store key blob (`strata.keys`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KeyFile {
    /// Unencrypted repositories still need a secret content-ID key.
    Plaintext { content_id_key: String },
    Aes256Gcm(EncryptedKey),
}

impl MasterKey {
    /// Generate a new random master key using OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut content_id_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut content_id_key);
        Self {
            encryption_key,
            content_id_key,
        }
    }

    /// Encrypt the master key with a passphrase using Argon2id + AES-256-GCM.
    pub fn to_encrypted(&self, passphrase: &str) -> Result<EncryptedKey> {
        self.to_encrypted_with(passphrase, default_kdf_cost())
    }

    fn to_encrypted_with(&self, passphrase: &str, cost: (u32, u32, u32)) -> Result<EncryptedKey> {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let (time_cost, memory_cost, parallelism) = cost;
        let kdf = KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost,
            memory_cost,
            parallelism,
            salt,
        };
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
            content_id_key: self.content_id_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        // KDF params are bound as AAD so they cannot be swapped undetected.
        let kdf_aad = kdf_params_aad(&kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| StrataError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &kdf_aad,
                },
            )
            .map_err(|e| StrataError::KeyDerivation(format!("encrypt: {e}")))?;

        Ok(EncryptedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            encrypted_payload: ciphertext,
        })
    }

    /// Decrypt the master key from its stored form.
    pub fn from_encrypted(encrypted: &EncryptedKey, passphrase: &str) -> Result<Self> {
        let wrapping_key = derive_key_from_passphrase(passphrase, &encrypted.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| StrataError::DecryptionFailed)?;
        if encrypted.nonce.len() != 12 {
            return Err(StrataError::DecryptionFailed);
        }
        let kdf_aad = kdf_params_aad(&encrypted.kdf)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&encrypted.nonce),
                Payload {
                    msg: encrypted.encrypted_payload.as_ref(),
                    aad: &kdf_aad,
                },
            )
            .map_err(|_| StrataError::DecryptionFailed)?;
        let plaintext = Zeroizing::new(plaintext);

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| StrataError::DecryptionFailed)?;
        if payload.encryption_key.len() != 32 || payload.content_id_key.len() != 32 {
            return Err(StrataError::DecryptionFailed);
        }
        let mut key = Self {
            encryption_key: [0u8; 32],
            content_id_key: [0u8; 32],
        };
        key.encryption_key.copy_from_slice(&payload.encryption_key);
        key.content_id_key.copy_from_slice(&payload.content_id_key);
        Ok(key)
    }
}

impl KeyFile {
    /// Create the key blob for a new repository.
    pub fn create(
        mode: EncryptionMode,
        key: &MasterKey,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        match mode {
            EncryptionMode::None => Ok(KeyFile::Plaintext {
                content_id_key: hex::encode(key.content_id_key),
            }),
            EncryptionMode::Aes256Gcm => {
                let passphrase = passphrase.ok_or_else(|| {
                    StrataError::Config("a passphrase is required for encryption".into())
                })?;
                Ok(KeyFile::Aes256Gcm(key.to_encrypted(passphrase)?))
            }
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        match self {
            KeyFile::Plaintext { .. } => EncryptionMode::None,
            KeyFile::Aes256Gcm(_) => EncryptionMode::Aes256Gcm,
        }
    }

    /// Unlock the key blob and build the matching engine.
    pub fn open_engine(&self, passphrase: Option<&str>) -> Result<Arc<dyn CryptoEngine>> {
        match self {
            KeyFile::Plaintext { content_id_key } => {
                let raw = hex::decode(content_id_key)
                    .map_err(|e| StrataError::InvalidFormat(format!("content id key: {e}")))?;
                let key: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    StrataError::InvalidFormat("content id key must be 32 bytes".into())
                })?;
                Ok(Arc::new(PlaintextEngine::new(&key)))
            }
            KeyFile::Aes256Gcm(encrypted) => {
                let passphrase = passphrase.ok_or_else(|| {
                    StrataError::Config("repository is encrypted; passphrase required".into())
                })?;
                let master = MasterKey::from_encrypted(encrypted, passphrase)?;
                Ok(Arc::new(Aes256GcmEngine::new(
                    &master.encryption_key,
                    &master.content_id_key,
                )))
            }
        }
    }
}

fn default_kdf_cost() -> (u32, u32, u32) {
    if cfg!(test) {
        (1, 8 * 1024, 1)
    } else {
        (3, 64 * 1024, 4)
    }
}

fn kdf_params_aad(kdf: &KdfParams) -> Result<Vec<u8>> {
    rmp_serde::to_vec(kdf)
        .map_err(|e| StrataError::KeyDerivation(format!("serialize kdf aad: {e}")))
}

fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| StrataError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| StrataError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_key_roundtrip() {
        let key = MasterKey::generate();
        let file = KeyFile::create(EncryptionMode::Aes256Gcm, &key, Some("hunter2")).unwrap();
        let engine = file.open_engine(Some("hunter2")).unwrap();
        assert!(engine.is_encrypting());
        assert_eq!(engine.content_id_key(), &key.content_id_key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let key = MasterKey::generate();
        let file = KeyFile::create(EncryptionMode::Aes256Gcm, &key, Some("right")).unwrap();
        assert!(matches!(
            file.open_engine(Some("wrong")),
            Err(StrataError::DecryptionFailed)
        ));
    }

    #[test]
    fn plaintext_key_file_survives_json() {
        let key = MasterKey::generate();
        let file = KeyFile::create(EncryptionMode::None, &key, None).unwrap();
        let json = serde_json::to_vec(&file).unwrap();
        let back: KeyFile = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.mode(), EncryptionMode::None);
        let engine = back.open_engine(None).unwrap();
        assert_eq!(engine.content_id_key(), &key.content_id_key);
    }

    #[test]
    fn encrypted_mode_requires_passphrase() {
        let key = MasterKey::generate();
        assert!(KeyFile::create(EncryptionMode::Aes256Gcm, &key, None).is_err());
    }
}
