//! Error taxonomy for the passkey session engine.
//!
//! Every module-level error converts into [`EngineError`]. Callers branch on
//! [`EngineError::class`] to decide between retrying, re-prompting the user
//! for a fresh authorization, or aborting.

use std::fmt;

use thiserror::Error;

use pke_crypto::content::ContentError;
use pke_crypto::der::DerError;
use pke_crypto::rlp::CodecError;
use pke_crypto::signature::SignatureError;

use crate::keystore::KeyStoreError;
use crate::rpc::RpcError;
use crate::store::StoreError;

// ============================================================================
// Engine Error
// ============================================================================

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed DER, point, or list encoding. Never retried.
    #[error("crypto decode error: {0}")]
    CryptoDecode(String),

    /// Authenticator declined, errored, or answered for another relying party.
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// User dismissed the authenticator prompt.
    #[error("cancelled by user")]
    UserCancelled,

    #[error("relay rejected fees after {attempts} attempts: {last_error}")]
    UnderpricedRetryExhausted { attempts: u32, last_error: String },

    #[error("transaction {tx_hash} was not confirmed in time")]
    ReceiptTimeout { tx_hash: String },

    #[error("transaction {tx_hash} reverted on chain (status {status})")]
    RevertedOnChain { tx_hash: String, status: String },

    /// Owner mismatch, expiry, or missing hardware entry.
    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),

    /// Persisted record missing or malformed; treated as absence.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("content cipher error: {0}")]
    Content(#[from] ContentError),
}

/// What a caller should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; the same request may succeed later.
    Retry,
    /// The session key is unusable; run the authorization flow again.
    Reauthorize,
    /// Do not retry.
    Fatal,
    /// User-initiated; show nothing.
    Silent,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::UserCancelled => ErrorClass::Silent,
            EngineError::InvalidSessionKey(_) | EngineError::StorageCorruption(_) => {
                ErrorClass::Reauthorize
            }
            EngineError::AuthorizationFailed(_)
            | EngineError::UnderpricedRetryExhausted { .. }
            | EngineError::ReceiptTimeout { .. }
            | EngineError::Transient(_)
            | EngineError::Storage(_) => ErrorClass::Retry,
            EngineError::CryptoDecode(_)
            | EngineError::RevertedOnChain { .. }
            | EngineError::Protocol(_)
            | EngineError::KeyStore(_)
            | EngineError::Content(_) => ErrorClass::Fatal,
        }
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        EngineError::CryptoDecode(e.to_string())
    }
}

impl From<DerError> for EngineError {
    fn from(e: DerError) -> Self {
        EngineError::CryptoDecode(format!("der signature: {e}"))
    }
}

impl From<SignatureError> for EngineError {
    fn from(e: SignatureError) -> Self {
        EngineError::CryptoDecode(e.to_string())
    }
}

impl From<KeyStoreError> for EngineError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::AliasNotFound(alias) => {
                EngineError::InvalidSessionKey(format!("key alias {alias} no longer exists"))
            }
            other => EngineError::KeyStore(other.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DataCorruption(msg) => EngineError::StorageCorruption(msg),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

impl From<RpcError> for EngineError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Transport(msg) => EngineError::Transient(msg),
            RpcError::Rejected { code, message } => {
                EngineError::Protocol(format!("rejected ({code}): {message}"))
            }
            RpcError::Protocol(msg) => EngineError::Protocol(msg),
        }
    }
}

// ============================================================================
// Authorization Stage Errors
// ============================================================================

/// Pipeline stage of the session authorization flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStage {
    Check,
    Generate,
    Delegate,
    Quote,
    Submit,
    Receipt,
    Persist,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthStage::Check => "checking saved session key",
            AuthStage::Generate => "generating session key",
            AuthStage::Delegate => "signing delegation",
            AuthStage::Quote => "quoting fees",
            AuthStage::Submit => "submitting authorization",
            AuthStage::Receipt => "awaiting receipt",
            AuthStage::Persist => "saving session key",
        };
        f.write_str(s)
    }
}

/// Authorization failure tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("session authorization failed while {stage}: {source}")]
pub struct AuthorizeError {
    pub stage: AuthStage,
    #[source]
    pub source: EngineError,
}

impl AuthorizeError {
    pub fn new(stage: AuthStage, source: impl Into<EngineError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.source.class()
    }
}
