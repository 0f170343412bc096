//! Storage abstraction for persisted session key records.
//!
//! This module defines the `SessionKeyStore` trait with an in-memory
//! implementation for tests and a JSON-file implementation for devices.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Data Models
// ============================================================================

/// Persisted form of a session key. Keyed by lowercase owner address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyRecord {
    /// Key store alias of the hardware-held key
    pub alias: String,
    /// Public key x coordinate, hex
    pub public_key_x: String,
    /// Public key y coordinate, hex
    pub public_key_y: String,
    /// Derived session key address, hex
    pub address: String,
    /// Owning account address, hex
    pub owner: String,
    /// Signed delegation payload, hex
    #[serde(default)]
    pub key_authorization: Option<String>,
    pub expires_at: u64,
    pub created_at: u64,
    pub pre_hash: bool,
}

pub fn owner_key(owner: &str) -> String {
    owner.trim().trim_start_matches("0x").to_ascii_lowercase()
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait SessionKeyStore: Send + Sync {
    /// Insert or replace the record for `record.owner`.
    async fn save(&self, record: SessionKeyRecord) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing is stored; `DataCorruption` when the stored
    /// bytes do not parse as a complete record.
    async fn load(&self, owner: &str) -> Result<Option<SessionKeyRecord>, StoreError>;

    /// Succeeds when the record did not exist.
    async fn delete(&self, owner: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    records: Arc<RwLock<HashMap<String, SessionKeyRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionKeyStore for InMemorySessionStore {
    async fn save(&self, record: SessionKeyRecord) -> Result<(), StoreError> {
        let key = owner_key(&record.owner);
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn load(&self, owner: &str) -> Result<Option<SessionKeyRecord>, StoreError> {
        Ok(self.records.read().await.get(&owner_key(owner)).cloned())
    }

    async fn delete(&self, owner: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(&owner_key(owner));
        Ok(())
    }
}

// ============================================================================
// JSON File Implementation
// ============================================================================

/// One `session-<owner>.json` file per owner under `dir`.
#[derive(Clone, Debug)]
pub struct JsonFileSessionStore {
    dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, owner: &str) -> PathBuf {
        self.dir.join(format!("session-{}.json", owner_key(owner)))
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::OperationFailed(format!("create {}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| StoreError::OperationFailed(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::OperationFailed(format!("rename {}: {e}", path.display())))
}

pub(crate) async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::OperationFailed(format!("read {}: {e}", path.display()))),
    }
}

#[async_trait]
impl SessionKeyStore for JsonFileSessionStore {
    async fn save(&self, record: SessionKeyRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.owner);
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&path, &json).await?;
        debug!(path = %path.display(), "saved session key record");
        Ok(())
    }

    async fn load(&self, owner: &str) -> Result<Option<SessionKeyRecord>, StoreError> {
        let path = self.path_for(owner);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<SessionKeyRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable session key record");
                Err(StoreError::DataCorruption(format!("{}: {e}", path.display())))
            }
        }
    }

    async fn delete(&self, owner: &str) -> Result<(), StoreError> {
        let path = self.path_for(owner);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::OperationFailed(format!("remove {}: {e}", path.display()))),
        }
    }
}
