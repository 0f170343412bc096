//! Secure key store capability for non-exportable P-256 signing keys.
//!
//! Platform implementations (hardware keystores) live outside this crate;
//! the engine only ever signs "by alias". [`SoftwareKeyStore`] is the
//! in-process fallback used on targets without a hardware keystore.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand_core::OsRng;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use pke_crypto::signature::P256PublicKey;

/// Security tier, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyTier {
    StrongBox,
    TrustedEnvironment,
    Software,
}

impl KeyTier {
    pub fn fallback(self) -> Option<KeyTier> {
        match self {
            KeyTier::StrongBox => Some(KeyTier::TrustedEnvironment),
            KeyTier::TrustedEnvironment => Some(KeyTier::Software),
            KeyTier::Software => None,
        }
    }
}

impl fmt::Display for KeyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyTier::StrongBox => "strongbox",
            KeyTier::TrustedEnvironment => "tee",
            KeyTier::Software => "software",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("key tier {0} unavailable")]
    TierUnavailable(KeyTier),
    #[error("key alias already exists: {0}")]
    AliasExists(String),
    #[error("key alias not found: {0}")]
    AliasNotFound(String),
    #[error("key store backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Create a non-exportable P-256 keypair under `alias`.
    async fn generate_key_pair(&self, alias: &str, tier: KeyTier) -> Result<P256PublicKey, KeyStoreError>;

    /// ECDSA-SHA256 over `digest` (the digest is hashed once more), DER encoded.
    async fn sign_digest(&self, alias: &str, digest: &[u8; 32]) -> Result<Vec<u8>, KeyStoreError>;

    async fn alias_exists(&self, alias: &str) -> bool;

    async fn delete_alias(&self, alias: &str) -> Result<(), KeyStoreError>;
}

/// Generate at `preferred` or the strongest lower tier that is available.
pub async fn generate_with_fallback(
    store: &dyn SecureKeyStore,
    alias: &str,
    preferred: KeyTier,
) -> Result<(P256PublicKey, KeyTier), KeyStoreError> {
    let mut tier = preferred;
    loop {
        match store.generate_key_pair(alias, tier).await {
            Ok(public_key) => {
                info!(alias = %alias, tier = %tier, "generated session signing key");
                return Ok((public_key, tier));
            }
            Err(KeyStoreError::TierUnavailable(t)) => match t.fallback() {
                Some(next) => {
                    warn!(alias = %alias, unavailable = %t, next = %next, "key tier unavailable, falling back");
                    tier = next;
                }
                None => return Err(KeyStoreError::TierUnavailable(t)),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Random alias for a new session key.
pub fn new_alias(prefix: &str) -> Result<String, KeyStoreError> {
    let mut b = [0u8; 12];
    getrandom::getrandom(&mut b).map_err(|e| KeyStoreError::Backend(e.to_string()))?;
    Ok(format!("{}-{}", prefix, hex::encode(b)))
}

// ============================================================================
// Software Key Store
// ============================================================================

/// In-process key store. Only offers [`KeyTier::Software`].
#[derive(Clone, Default)]
pub struct SoftwareKeyStore {
    keys: Arc<RwLock<HashMap<String, SigningKey>>>,
}

impl SoftwareKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[async_trait]
impl SecureKeyStore for SoftwareKeyStore {
    async fn generate_key_pair(&self, alias: &str, tier: KeyTier) -> Result<P256PublicKey, KeyStoreError> {
        if tier != KeyTier::Software {
            return Err(KeyStoreError::TierUnavailable(tier));
        }
        let mut keys = self.keys.write().await;
        if keys.contains_key(alias) {
            return Err(KeyStoreError::AliasExists(alias.to_string()));
        }
        let key = SigningKey::random(&mut OsRng);
        let public = P256PublicKey::from(&p256::PublicKey::from(key.verifying_key()));
        keys.insert(alias.to_string(), key);
        Ok(public)
    }

    async fn sign_digest(&self, alias: &str, digest: &[u8; 32]) -> Result<Vec<u8>, KeyStoreError> {
        let keys = self.keys.read().await;
        let key = keys
            .get(alias)
            .ok_or_else(|| KeyStoreError::AliasNotFound(alias.to_string()))?;
        let sig: Signature = key.sign(digest);
        Ok(sig.to_der().as_bytes().to_vec())
    }

    async fn alias_exists(&self, alias: &str) -> bool {
        self.keys.read().await.contains_key(alias)
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), KeyStoreError> {
        if self.keys.write().await.remove(alias).is_some() {
            debug!(alias = %alias, "deleted key alias");
        }
        Ok(())
    }
}
