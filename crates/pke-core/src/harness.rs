//! Test harness for the session engine.
//!
//! Scripted stand-ins for the platform authenticator, chain node and fee
//! relay, plus [`TestEnv`] wiring them into a [`SessionAuthorizer`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand_core::{OsRng, RngCore};
use tokio::sync::Mutex;

use pke_crypto::hash::{keccak256, sha256};
use pke_crypto::rlp::decode;
use pke_crypto::signature::P256PublicKey;

use crate::authorize::{AuthorizerConfig, SessionAuthorizer};
use crate::keystore::SoftwareKeyStore;
use crate::passkey::{AssertionRequest, AuthenticatorOutcome, PasskeyAccount, PasskeySigner, PlatformAuthenticator, RawAssertion};
use crate::rpc::{BlockTag, ChainRpc, FeeRelay, GasEstimateRequest, RpcError, TransactionReceipt, TransactionSummary};
use crate::session_key::{ManualClock, SessionKeyManager};
use crate::store::InMemorySessionStore;

/// authenticator data flags: user present | user verified
const FLAGS_UP_UV: u8 = 0x05;

// ============================================================================
// Software Passkey
// ============================================================================

/// Authenticator backed by an in-memory P-256 key. Answers every prompt
/// unless an outcome was queued with [`SoftwarePasskey::push_outcome`].
pub struct SoftwarePasskey {
    key: SigningKey,
    rp_id: String,
    credential_id: Vec<u8>,
    counter: AtomicU32,
    prompts: AtomicUsize,
    queued: Mutex<VecDeque<AuthenticatorOutcome>>,
}

impl SoftwarePasskey {
    pub fn new(rp_id: &str) -> Self {
        let mut credential_id = vec![0u8; 16];
        OsRng.fill_bytes(&mut credential_id);
        Self {
            key: SigningKey::random(&mut OsRng),
            rp_id: rp_id.to_string(),
            credential_id,
            counter: AtomicU32::new(0),
            prompts: AtomicUsize::new(0),
            queued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn account(&self) -> PasskeyAccount {
        let public = P256PublicKey::from(&p256::PublicKey::from(self.key.verifying_key()));
        PasskeyAccount::new(public, self.credential_id.clone(), self.rp_id.clone())
    }

    /// A well-formed assertion over `challenge`.
    pub fn assert(&self, challenge: &[u8; 32]) -> RawAssertion {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut authenticator_data = sha256(self.rp_id.as_bytes()).to_vec();
        authenticator_data.push(FLAGS_UP_UV);
        authenticator_data.extend_from_slice(&counter.to_be_bytes());

        let client_data_json = serde_json::json!({
            "type": "webauthn.get",
            "challenge": URL_SAFE_NO_PAD.encode(challenge),
            "origin": format!("https://{}", self.rp_id),
            "crossOrigin": false,
        })
        .to_string()
        .into_bytes();

        let mut message = authenticator_data.clone();
        message.extend_from_slice(&sha256(&client_data_json));
        let signature: Signature = self.key.sign(&message);

        RawAssertion {
            authenticator_data,
            client_data_json,
            signature: signature.to_der().as_bytes().to_vec(),
            rp_id: self.rp_id.clone(),
            credential_id: self.credential_id.clone(),
        }
    }

    pub async fn push_outcome(&self, outcome: AuthenticatorOutcome) {
        self.queued.lock().await.push_back(outcome);
    }

    /// Number of prompts shown so far.
    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAuthenticator for SoftwarePasskey {
    async fn get_assertion(&self, request: AssertionRequest) -> AuthenticatorOutcome {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.queued.lock().await.pop_front() {
            return outcome;
        }
        if request.rp_id != self.rp_id {
            return AuthenticatorOutcome::Error(format!("no credential for {}", request.rp_id));
        }
        AuthenticatorOutcome::Ok(self.assert(&request.challenge))
    }
}

// ============================================================================
// Scripted Chain RPC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptScript {
    /// Successful receipt on the first poll.
    Success,
    /// Successful receipt after this many empty polls.
    AfterPolls(usize),
    /// Receipt with status `0x0`.
    Revert,
    /// Never mined.
    Never,
}

pub struct ScriptedRpc {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: Mutex<u128>,
    pub gas_estimate: u64,
    pub receipt: Mutex<ReceiptScript>,
    /// Whether `get_transaction_by_hash` finds submitted transactions.
    pub known_by_hash: Mutex<bool>,
    estimate_errors: Mutex<VecDeque<RpcError>>,
    send_errors: Mutex<VecDeque<RpcError>>,
    sent: Mutex<Vec<String>>,
    receipt_polls: AtomicUsize,
    by_hash_calls: AtomicUsize,
}

impl ScriptedRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            nonce: 7,
            gas_price: Mutex::new(1_000_000_000),
            gas_estimate: 100_000,
            receipt: Mutex::new(ReceiptScript::Success),
            known_by_hash: Mutex::new(true),
            estimate_errors: Mutex::new(VecDeque::new()),
            send_errors: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            receipt_polls: AtomicUsize::new(0),
            by_hash_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_receipt(&self, script: ReceiptScript) {
        *self.receipt.lock().await = script;
    }

    pub async fn set_known_by_hash(&self, known: bool) {
        *self.known_by_hash.lock().await = known;
    }

    /// Errors returned by the next `estimate_gas` calls, in order.
    pub async fn push_estimate_error(&self, err: RpcError) {
        self.estimate_errors.lock().await.push_back(err);
    }

    /// Errors returned by the next `send_raw_transaction` calls, in order.
    pub async fn push_send_error(&self, err: RpcError) {
        self.send_errors.lock().await.push_back(err);
    }

    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    pub fn receipt_polls(&self) -> usize {
        self.receipt_polls.load(Ordering::SeqCst)
    }

    pub fn by_hash_calls(&self) -> usize {
        self.by_hash_calls.load(Ordering::SeqCst)
    }
}

fn tx_hash_of(signed_hex: &str) -> String {
    let bytes = hex::decode(signed_hex.trim_start_matches("0x")).unwrap_or_default();
    format!("0x{}", hex::encode(keccak256(&bytes)))
}

#[async_trait]
impl ChainRpc for ScriptedRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.chain_id)
    }

    async fn get_nonce(&self, _address: &Address, _tag: BlockTag) -> Result<u64, RpcError> {
        Ok(self.nonce)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(*self.gas_price.lock().await)
    }

    async fn estimate_gas(&self, _request: &GasEstimateRequest) -> Result<u64, RpcError> {
        if let Some(err) = self.estimate_errors.lock().await.pop_front() {
            return Err(err);
        }
        Ok(self.gas_estimate)
    }

    async fn send_raw_transaction(&self, signed_hex: &str) -> Result<String, RpcError> {
        if let Some(err) = self.send_errors.lock().await.pop_front() {
            return Err(err);
        }
        self.sent.lock().await.push(signed_hex.to_string());
        Ok(tx_hash_of(signed_hex))
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, RpcError> {
        let polls = self.receipt_polls.fetch_add(1, Ordering::SeqCst) + 1;
        let receipt = |status: &str| TransactionReceipt {
            transaction_hash: tx_hash.to_string(),
            status: status.to_string(),
            block_number: Some("0x1".to_string()),
            gas_used: Some("0x5208".to_string()),
        };
        Ok(match &*self.receipt.lock().await {
            ReceiptScript::Success => Some(receipt("0x1")),
            ReceiptScript::AfterPolls(n) if polls > *n => Some(receipt("0x1")),
            ReceiptScript::AfterPolls(_) | ReceiptScript::Never => None,
            ReceiptScript::Revert => Some(receipt("0x0")),
        })
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<TransactionSummary>, RpcError> {
        self.by_hash_calls.fetch_add(1, Ordering::SeqCst);
        let known = *self.known_by_hash.lock().await;
        Ok(known.then(|| TransactionSummary {
            hash: tx_hash.to_string(),
            block_number: None,
        }))
    }
}

// ============================================================================
// Scripted Fee Relay
// ============================================================================

/// `<sender(20)><marker(6)>` in hex.
const SENDER_HINT_HEX_LEN: usize = 52;

/// Records every hinted transaction and returns it with the hint removed.
#[derive(Default)]
pub struct ScriptedRelay {
    errors: Mutex<VecDeque<RpcError>>,
    hinted: Mutex<Vec<String>>,
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_error(&self, err: RpcError) {
        self.errors.lock().await.push_back(err);
    }

    pub async fn push_underpriced(&self, times: usize) {
        for _ in 0..times {
            self.push_error(RpcError::Rejected {
                code: -32000,
                message: "transaction underpriced".to_string(),
            })
            .await;
        }
    }

    pub async fn hinted(&self) -> Vec<String> {
        self.hinted.lock().await.clone()
    }

    /// `(priority, max_fee)` of every transaction handed to the relay.
    pub async fn submitted_fees(&self) -> Vec<(u64, u64)> {
        self.hinted
            .lock()
            .await
            .iter()
            .filter_map(|h| decode_fees(strip_hint(h)))
            .collect()
    }
}

fn strip_hint(hinted: &str) -> &str {
    let body = hinted.trim_start_matches("0x");
    &body[..body.len().saturating_sub(SENDER_HINT_HEX_LEN)]
}

fn decode_fees(tx_hex: &str) -> Option<(u64, u64)> {
    let bytes = hex::decode(tx_hex.trim_start_matches("0x")).ok()?;
    let item = decode(bytes.get(1..)?).ok()?;
    let fields = item.as_list().ok()?;
    Some((fields.get(1)?.as_u64().ok()?, fields.get(2)?.as_u64().ok()?))
}

#[async_trait]
impl FeeRelay for ScriptedRelay {
    async fn sign_raw_transaction(&self, hinted_hex: &str) -> Result<String, RpcError> {
        self.hinted.lock().await.push(hinted_hex.to_string());
        if let Some(err) = self.errors.lock().await.pop_front() {
            return Err(err);
        }
        Ok(format!("0x{}", strip_hint(hinted_hex)))
    }
}

// ============================================================================
// Test Environment
// ============================================================================

pub const TEST_CHAIN_ID: u64 = 42431;
pub const TEST_RP_ID: &str = "app.example";
pub const TEST_START: u64 = 1_700_000_000;

/// Fully wired authorizer over scripted collaborators.
pub struct TestEnv {
    pub keystore: Arc<SoftwareKeyStore>,
    pub store: Arc<InMemorySessionStore>,
    pub clock: Arc<ManualClock>,
    pub passkey: Arc<SoftwarePasskey>,
    pub rpc: Arc<ScriptedRpc>,
    pub relay: Arc<ScriptedRelay>,
    pub authorizer: Arc<SessionAuthorizer>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(AuthorizerConfig {
            chain_id: TEST_CHAIN_ID,
            ..AuthorizerConfig::default()
        })
    }

    pub fn with_config(config: AuthorizerConfig) -> Self {
        let keystore = Arc::new(SoftwareKeyStore::new());
        let store = Arc::new(InMemorySessionStore::new());
        let clock = Arc::new(ManualClock::new(TEST_START));
        let passkey = Arc::new(SoftwarePasskey::new(TEST_RP_ID));
        let rpc = Arc::new(ScriptedRpc::new(config.chain_id));
        let relay = Arc::new(ScriptedRelay::new());

        let sessions = SessionKeyManager::new(keystore.clone(), store.clone(), clock.clone(), config.chain_id);
        let authorizer = Arc::new(SessionAuthorizer::new(
            sessions,
            PasskeySigner::new(passkey.clone()),
            rpc.clone(),
            relay.clone(),
            config,
        ));

        Self {
            keystore,
            store,
            clock,
            passkey,
            rpc,
            relay,
            authorizer,
        }
    }

    pub fn account(&self) -> PasskeyAccount {
        self.passkey.account()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
