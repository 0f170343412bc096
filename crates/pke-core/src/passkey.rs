//! Root credential signer.
//!
//! Presents a 32-byte challenge to the platform authenticator bound to a
//! passkey account and turns the returned assertion into a scheme `0x02`
//! signature. The authenticator reports declines and cancellations as
//! tagged outcomes; only `Cancelled` becomes [`EngineError::UserCancelled`].

use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use pke_crypto::der::{normalize_low_s, parse_der_signature};
use pke_crypto::hash::{sha256, webauthn_message_hash};
use pke_crypto::signature::{P256PublicKey, SchemeSignature, WebAuthnSignature};
use pke_crypto::utils::constant_time_compare;

use crate::errors::EngineError;

/// rpIdHash(32) ‖ flags(1) ‖ signCount(4)
pub const MIN_AUTHENTICATOR_DATA_LEN: usize = 37;
const FLAG_USER_PRESENT: u8 = 0x01;
const CLIENT_DATA_TYPE_GET: &str = "webauthn.get";

// ============================================================================
// Data Models
// ============================================================================

/// Registered passkey. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasskeyAccount {
    pub public_key: P256PublicKey,
    pub address: Address,
    pub credential_id: Vec<u8>,
    pub rp_id: String,
}

impl PasskeyAccount {
    pub fn new(public_key: P256PublicKey, credential_id: Vec<u8>, rp_id: impl Into<String>) -> Self {
        Self {
            address: public_key.address(),
            public_key,
            credential_id,
            rp_id: rp_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionRequest {
    pub rp_id: String,
    pub challenge: [u8; 32],
    pub allow_credentials: Vec<Vec<u8>>,
}

/// What the platform authenticator hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAssertion {
    pub authenticator_data: Vec<u8>,
    pub client_data_json: Vec<u8>,
    /// DER-encoded ECDSA signature.
    pub signature: Vec<u8>,
    /// Relying party the authenticator actually used.
    pub rp_id: String,
    pub credential_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticatorOutcome {
    Ok(RawAssertion),
    Declined,
    Cancelled,
    Error(String),
}

#[async_trait]
pub trait PlatformAuthenticator: Send + Sync {
    /// Suspends until the user completes or dismisses the prompt.
    async fn get_assertion(&self, request: AssertionRequest) -> AuthenticatorOutcome;
}

/// Parsed root signature over a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// authenticator data ‖ client data JSON
    pub context_bytes: Vec<u8>,
    pub r: [u8; 32],
    /// Low-S normalized.
    pub s: [u8; 32],
    pub public_key: P256PublicKey,
}

impl Assertion {
    pub fn to_scheme_signature(&self) -> SchemeSignature {
        SchemeSignature::WebAuthn(WebAuthnSignature {
            webauthn_data: self.context_bytes.clone(),
            r: self.r,
            s: self.s,
            public_key: self.public_key,
        })
    }
}

#[derive(Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    kind: String,
    challenge: String,
}

// ============================================================================
// Signer
// ============================================================================

#[derive(Clone)]
pub struct PasskeySigner {
    authenticator: Arc<dyn PlatformAuthenticator>,
}

impl PasskeySigner {
    pub fn new(authenticator: Arc<dyn PlatformAuthenticator>) -> Self {
        Self { authenticator }
    }

    pub async fn sign(&self, challenge: &[u8; 32], account: &PasskeyAccount) -> Result<Assertion, EngineError> {
        let request = AssertionRequest {
            rp_id: account.rp_id.clone(),
            challenge: *challenge,
            allow_credentials: vec![account.credential_id.clone()],
        };
        debug!(account = %account.address, rp_id = %account.rp_id, "requesting passkey assertion");

        let raw = match self.authenticator.get_assertion(request).await {
            AuthenticatorOutcome::Ok(raw) => raw,
            AuthenticatorOutcome::Cancelled => {
                info!(account = %account.address, "passkey prompt cancelled");
                return Err(EngineError::UserCancelled);
            }
            AuthenticatorOutcome::Declined => {
                return Err(EngineError::AuthorizationFailed("authenticator declined".into()));
            }
            AuthenticatorOutcome::Error(reason) => {
                warn!(account = %account.address, reason = %reason, "authenticator error");
                return Err(EngineError::AuthorizationFailed(reason));
            }
        };

        check_assertion(&raw, challenge, account).map_err(|reason| {
            warn!(account = %account.address, reason = %reason, "rejected passkey assertion");
            EngineError::AuthorizationFailed(reason)
        })
    }
}

fn check_assertion(raw: &RawAssertion, challenge: &[u8; 32], account: &PasskeyAccount) -> Result<Assertion, String> {
    if raw.rp_id != account.rp_id {
        return Err(format!(
            "relying party mismatch: expected {}, got {}",
            account.rp_id, raw.rp_id
        ));
    }
    if !raw.credential_id.is_empty() && !constant_time_compare(&raw.credential_id, &account.credential_id) {
        return Err("assertion from a different credential".into());
    }

    let auth_data = &raw.authenticator_data;
    if auth_data.len() < MIN_AUTHENTICATOR_DATA_LEN {
        return Err(format!("authenticator data too short ({} bytes)", auth_data.len()));
    }
    if !constant_time_compare(&auth_data[..32], &sha256(account.rp_id.as_bytes())) {
        return Err("rpIdHash does not match relying party".into());
    }
    if auth_data[32] & FLAG_USER_PRESENT == 0 {
        return Err("user presence flag not set".into());
    }

    let client: ClientData =
        serde_json::from_slice(&raw.client_data_json).map_err(|e| format!("client data: {e}"))?;
    if client.kind != CLIENT_DATA_TYPE_GET {
        return Err(format!("unexpected client data type {:?}", client.kind));
    }
    if client.challenge != URL_SAFE_NO_PAD.encode(challenge) {
        return Err("client data challenge does not match".into());
    }

    let (r, s) = parse_der_signature(&raw.signature).map_err(|e| format!("signature: {e}"))?;
    if !verify_assertion(&account.public_key, raw) {
        return Err("signature does not verify against account key".into());
    }

    let mut context_bytes = Vec::with_capacity(auth_data.len() + raw.client_data_json.len());
    context_bytes.extend_from_slice(auth_data);
    context_bytes.extend_from_slice(&raw.client_data_json);

    Ok(Assertion {
        context_bytes,
        r,
        s: normalize_low_s(&s),
        public_key: account.public_key,
    })
}

/// P-256 check of `raw.signature` over sha256(authData ‖ sha256(clientDataJSON)).
pub fn verify_assertion(public_key: &P256PublicKey, raw: &RawAssertion) -> bool {
    let Ok(vk) = public_key.to_verifying_key() else {
        return false;
    };
    let Ok(sig) = Signature::from_der(&raw.signature) else {
        return false;
    };
    let message = webauthn_message_hash(&raw.authenticator_data, &raw.client_data_json);
    vk.verify_prehash(&message, &sig).is_ok()
}

// ============================================================================
// Account Registry
// ============================================================================

/// Passkey accounts known on this device.
#[derive(Clone, Default)]
pub struct AccountRegistry {
    accounts: Arc<RwLock<Vec<PasskeyAccount>>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing entry with the same credential id.
    pub async fn register(&self, account: PasskeyAccount) {
        let mut accounts = self.accounts.write().await;
        accounts.retain(|a| a.credential_id != account.credential_id);
        info!(account = %account.address, rp_id = %account.rp_id, "registered passkey account");
        accounts.push(account);
    }

    pub async fn find_by_credential_id(&self, credential_id: &[u8]) -> Option<PasskeyAccount> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| constant_time_compare(&a.credential_id, credential_id))
            .cloned()
    }

    /// Account whose key verifies `raw`. No account matches without a
    /// successful signature check, even when only one is registered.
    pub async fn find_by_signature(&self, raw: &RawAssertion) -> Option<PasskeyAccount> {
        self.accounts
            .read()
            .await
            .iter()
            .find(|a| a.rp_id == raw.rp_id && verify_assertion(&a.public_key, raw))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}
