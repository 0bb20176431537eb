use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AppError, Result};

/// Field-level encryption capability, keyed by key id so the key material
/// itself never travels with the data.
#[async_trait]
pub trait FieldCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String>;
    async fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String>;
}

/// AES-256-GCM keyring. Keys are registered up front or resolved lazily from
/// `<env_prefix><key_id>`.
pub struct AesGcmFieldCipher {
    keys: RwLock<HashMap<String, Key<Aes256Gcm>>>,
    env_prefix: Option<String>,
}

impl AesGcmFieldCipher {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            env_prefix: None,
        }
    }

    pub fn from_env(env_prefix: impl Into<String>) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            env_prefix: Some(env_prefix.into()),
        }
    }

    pub fn with_key(key_id: &str, key_base64: &str) -> Result<Self> {
        let key = parse_key(key_base64)?;
        let mut keys = HashMap::new();
        keys.insert(key_id.to_string(), key);
        Ok(Self {
            keys: RwLock::new(keys),
            env_prefix: None,
        })
    }

    pub async fn add_key(&self, key_id: &str, key_base64: &str) -> Result<()> {
        let key = parse_key(key_base64)?;
        self.keys.write().await.insert(key_id.to_string(), key);
        Ok(())
    }

    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        Base64::encode_string(key.as_slice())
    }

    async fn resolve_key(&self, key_id: &str) -> Result<Key<Aes256Gcm>> {
        if let Some(key) = self.keys.read().await.get(key_id) {
            return Ok(*key);
        }

        let prefix = self.env_prefix.as_deref().ok_or_else(|| {
            AppError::EncryptionError(format!("Unknown key id: {}", key_id))
        })?;
        let var = format!("{}{}", prefix, key_id);
        let key_base64 = std::env::var(&var).map_err(|_| {
            AppError::EncryptionError(format!("{} environment variable not set", var))
        })?;
        let key = parse_key(&key_base64)?;

        debug!(key_id = key_id, "🔑 Loaded encryption key from environment");
        self.keys.write().await.insert(key_id.to_string(), key);
        Ok(key)
    }
}

impl Default for AesGcmFieldCipher {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_key(key_base64: &str) -> Result<Key<Aes256Gcm>> {
    let key_bytes = Base64::decode_vec(key_base64)
        .map_err(|e| AppError::EncryptionError(format!("Invalid key format: {}", e)))?;

    if key_bytes.len() != 32 {
        return Err(AppError::EncryptionError(
            "Key must be 32 bytes (256 bits) long".to_string(),
        ));
    }

    Ok(*Key::<Aes256Gcm>::from_slice(&key_bytes))
}

#[async_trait]
impl FieldCipher for AesGcmFieldCipher {
    async fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String> {
        let key = self.resolve_key(key_id).await?;
        let cipher = Aes256Gcm::new(&key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::EncryptionError(format!("Encryption failed: {}", e)))?;

        // nonce || ciphertext, base64
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);

        Ok(Base64::encode_string(&combined))
    }

    async fn decrypt(&self, ciphertext_base64: &str, key_id: &str) -> Result<String> {
        let combined = Base64::decode_vec(ciphertext_base64)
            .map_err(|e| AppError::EncryptionError(format!("Invalid ciphertext format: {}", e)))?;

        if combined.len() < 12 {
            return Err(AppError::EncryptionError("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = self.resolve_key(key_id).await?;
        let cipher = Aes256Gcm::new(&key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext_bytes)
            .map_err(|e| AppError::EncryptionError(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| AppError::EncryptionError(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }
}

/// Irreversible field digest used for PII kept only for deduplication.
pub fn hash_field(value: &str, pepper: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Some(pepper) = pepper {
        hasher.update(pepper.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
