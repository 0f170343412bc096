//! Device content keypair and per-content wrapped keys.
//!
//! Files under the vault directory:
//! - `content_keypair_v1.json`: `{ "private_key": "enc:v1:…", "public_key": "04…" }`
//! - `content_wrapped_keys_v1.json`: content id → ECIES envelope (hex fields)
//!
//! A private key stored in the legacy plaintext hex form is sealed and
//! rewritten the first time it is loaded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pke_crypto::content::{
    derive_wrap_key, ecies_decrypt, ecies_encrypt, is_sealed, ContentError, ContentKey, ContentKeyPair,
    ContentSecretKey, EciesEnvelope, EnvelopeRecord, AES_KEY_LEN, UNCOMPRESSED_POINT_LEN,
};
use pke_crypto::utils::constant_time_compare;

use crate::errors::EngineError;
use crate::store::{read_optional, write_atomic};

pub const CONTENT_KEYPAIR_FILE: &str = "content_keypair_v1.json";
pub const WRAPPED_KEYS_FILE: &str = "content_wrapped_keys_v1.json";

const MACHINE_WRAP_SALT: &[u8] = b"pke-content-keypair-v1";

// ============================================================================
// Wrap Key Providers
// ============================================================================

/// Source of the symmetric key that seals the content secret at rest.
pub trait WrapKeyProvider: Send + Sync {
    fn wrap_key(&self) -> Result<ContentKey, ContentError>;
}

/// Wrap key bound to this machine: `/etc/machine-id`, or host, user and
/// home directory when that is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachineBoundWrapKey;

impl MachineBoundWrapKey {
    fn material() -> String {
        if let Ok(raw) = std::fs::read_to_string("/etc/machine-id") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        let var = |name: &str, fallback: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };
        format!(
            "{}:{}:{}",
            var("HOSTNAME", "unknown-host"),
            var("USER", "unknown-user"),
            var("HOME", ".")
        )
    }
}

impl WrapKeyProvider for MachineBoundWrapKey {
    fn wrap_key(&self) -> Result<ContentKey, ContentError> {
        derive_wrap_key(Self::material().as_bytes(), MACHINE_WRAP_SALT)
    }
}

/// Wrap key from caller-supplied material (platform keystore secret, tests).
#[derive(Clone)]
pub struct StaticWrapKey {
    material: Vec<u8>,
}

impl StaticWrapKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self {
            material: material.into(),
        }
    }
}

impl WrapKeyProvider for StaticWrapKey {
    fn wrap_key(&self) -> Result<ContentKey, ContentError> {
        derive_wrap_key(&self.material, MACHINE_WRAP_SALT)
    }
}

// ============================================================================
// Vault
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeyPair {
    private_key: String,
    public_key: String,
}

pub fn normalize_content_id(content_id: &str) -> String {
    content_id.trim().to_ascii_lowercase()
}

pub struct ContentKeyVault {
    dir: PathBuf,
    wrap: Arc<dyn WrapKeyProvider>,
    keypair: Mutex<Option<Arc<ContentKeyPair>>>,
    /// Serializes read-modify-write of the wrapped key map.
    wrapped: Mutex<()>,
}

impl ContentKeyVault {
    pub fn new(dir: impl Into<PathBuf>, wrap: Arc<dyn WrapKeyProvider>) -> Self {
        Self {
            dir: dir.into(),
            wrap,
            keypair: Mutex::new(None),
            wrapped: Mutex::new(()),
        }
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.dir.join(CONTENT_KEYPAIR_FILE)
    }

    pub fn wrapped_keys_path(&self) -> PathBuf {
        self.dir.join(WRAPPED_KEYS_FILE)
    }

    /// Load the device keypair, creating and sealing one on first use.
    pub async fn load_or_create(&self) -> Result<Arc<ContentKeyPair>, EngineError> {
        let mut cached = self.keypair.lock().await;
        if let Some(pair) = cached.as_ref() {
            return Ok(pair.clone());
        }

        let path = self.keypair_path();
        let wrap_key = self.wrap.wrap_key()?;
        let pair = match read_optional(&path).await? {
            None => {
                let pair = ContentKeyPair::generate();
                self.write_keypair(&pair, &wrap_key).await?;
                info!(path = %path.display(), "created content keypair");
                pair
            }
            Some(bytes) => {
                let stored: StoredKeyPair = serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::StorageCorruption(format!("content keypair: {e}")))?;
                let legacy = !is_sealed(&stored.private_key);
                let secret = if legacy {
                    ContentSecretKey::from_legacy_hex(&stored.private_key)?
                } else {
                    ContentSecretKey::unseal(&wrap_key, &stored.private_key)?
                };
                let pair = ContentKeyPair::from_secret(secret);
                let stored_public = hex::decode(stored.public_key.trim().trim_start_matches("0x"))
                    .map_err(|e| EngineError::StorageCorruption(format!("content public key: {e}")))?;
                if !constant_time_compare(&stored_public, &pair.public_key) {
                    return Err(EngineError::StorageCorruption(
                        "content public key does not match private key".into(),
                    ));
                }
                if legacy {
                    self.write_keypair(&pair, &wrap_key).await?;
                    info!(path = %path.display(), "sealed legacy plaintext content keypair");
                }
                pair
            }
        };

        let pair = Arc::new(pair);
        *cached = Some(pair.clone());
        Ok(pair)
    }

    async fn write_keypair(&self, pair: &ContentKeyPair, wrap_key: &[u8; AES_KEY_LEN]) -> Result<(), EngineError> {
        let stored = StoredKeyPair {
            private_key: pair.secret.seal(wrap_key)?,
            public_key: hex::encode(pair.public_key),
        };
        let json = serde_json::to_vec_pretty(&stored).map_err(|e| EngineError::Storage(e.to_string()))?;
        write_atomic(&self.keypair_path(), &json).await?;
        Ok(())
    }

    /// Uncompressed public key to publish for others to wrap to.
    pub async fn public_key(&self) -> Result<[u8; UNCOMPRESSED_POINT_LEN], EngineError> {
        Ok(self.load_or_create().await?.public_key)
    }

    pub fn encrypt_for_recipient(&self, recipient_public_key: &[u8], plaintext: &[u8]) -> Result<EciesEnvelope, EngineError> {
        Ok(ecies_encrypt(recipient_public_key, plaintext)?)
    }

    /// Open an envelope addressed to this device.
    pub async fn decrypt_envelope(&self, envelope: &EciesEnvelope) -> Result<Vec<u8>, EngineError> {
        let pair = self.load_or_create().await?;
        Ok(ecies_decrypt(&pair.secret, envelope)?)
    }

    // ------------------------------------------------------------------------
    // Wrapped keys
    // ------------------------------------------------------------------------

    async fn read_wrapped(&self) -> Result<HashMap<String, EnvelopeRecord>, EngineError> {
        let path = self.wrapped_keys_path();
        match read_optional(&path).await? {
            None => Ok(HashMap::new()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::StorageCorruption(format!("wrapped key store: {e}"))),
        }
    }

    async fn write_wrapped(&self, entries: &HashMap<String, EnvelopeRecord>) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(entries).map_err(|e| EngineError::Storage(e.to_string()))?;
        write_atomic(&self.wrapped_keys_path(), &json).await?;
        Ok(())
    }

    pub async fn save_wrapped_key(&self, content_id: &str, envelope: &EciesEnvelope) -> Result<(), EngineError> {
        let _guard = self.wrapped.lock().await;
        let mut entries = self.read_wrapped().await?;
        let id = normalize_content_id(content_id);
        entries.insert(id.clone(), envelope.to_record());
        self.write_wrapped(&entries).await?;
        debug!(content_id = %id, "saved wrapped content key");
        Ok(())
    }

    pub async fn load_wrapped_key(&self, content_id: &str) -> Result<Option<EciesEnvelope>, EngineError> {
        let _guard = self.wrapped.lock().await;
        let entries = self.read_wrapped().await?;
        match entries.get(&normalize_content_id(content_id)) {
            Some(record) => Ok(Some(EciesEnvelope::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Returns whether an entry was removed.
    pub async fn remove_wrapped_key(&self, content_id: &str) -> Result<bool, EngineError> {
        let _guard = self.wrapped.lock().await;
        let mut entries = self.read_wrapped().await?;
        let removed = entries.remove(&normalize_content_id(content_id)).is_some();
        if removed {
            self.write_wrapped(&entries).await?;
        }
        Ok(removed)
    }

    /// Decrypt the stored envelope for `content_id` to its AES key.
    pub async fn unwrap_content_key(&self, content_id: &str) -> Result<Option<ContentKey>, EngineError> {
        let Some(envelope) = self.load_wrapped_key(content_id).await? else {
            return Ok(None);
        };
        let plaintext = zeroize::Zeroizing::new(self.decrypt_envelope(&envelope).await?);
        let key: [u8; AES_KEY_LEN] = plaintext.as_slice().try_into().map_err(|_| {
            warn!(content_id = %content_id, len = plaintext.len(), "wrapped key has wrong length");
            EngineError::Content(ContentError::InvalidLength {
                field: "content key",
                expected: AES_KEY_LEN,
                actual: plaintext.len(),
            })
        })?;
        Ok(Some(zeroize::Zeroizing::new(key)))
    }
}
