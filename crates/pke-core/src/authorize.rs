//! Session authorization orchestrator.
//!
//! `ensure_session_key` returns a usable session key for a passkey account:
//! a cached or saved key when it is still valid, otherwise a freshly minted
//! key delegated on chain through a root-signed, relay-sponsored transaction.
//!
//! Per-owner state machine:
//!
//! ```text
//! Checking ──► Authorizing { stage } ──► Ready { expires_at }
//!                         └────────────► Failed { stage, reason }
//! ```
//!
//! One authorization runs at a time per service instance. Once a key has
//! been generated, every failure path (including dropping the future)
//! deletes its key store alias.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pke_crypto::signature::SchemeSignature;

use crate::config::EngineConfig;
use crate::errors::{AuthStage, AuthorizeError, EngineError};
use crate::fees::{AddressLocks, FeeFloorCache, FeePolicy, FeeQuote};
use crate::keystore::SecureKeyStore;
use crate::passkey::{PasskeyAccount, PasskeySigner};
use crate::rpc::{BlockTag, ChainRpc, FeeRelay, GasEstimateRequest, RpcError, TransactionReceipt};
use crate::session_key::{SessionKey, SessionKeyManager};
use crate::transaction::{append_sender_hint, Call, FeeMode, NonceKey, SignedTransaction, UnsignedTransaction};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationState {
    Checking,
    Authorizing { stage: AuthStage },
    Ready { expires_at: u64 },
    Failed { stage: AuthStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizerConfig {
    pub chain_id: u64,
    pub fee_policy: FeePolicy,
    pub max_underpriced_retries: u32,
    pub max_transient_retries: u32,
    pub transient_retry_delay: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub authorize_gas_limit_floor: u64,
    pub gas_limit_buffer: u64,
    pub fee_token: Option<Address>,
}

impl AuthorizerConfig {
    pub fn from_engine(config: &EngineConfig) -> Result<Self, EngineError> {
        let fee_token = config
            .fee_token_address()
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        Ok(Self {
            chain_id: config.chain_id,
            fee_policy: config.fee_policy(),
            max_underpriced_retries: config.max_underpriced_retries,
            max_transient_retries: config.max_transient_retries,
            transient_retry_delay: config.transient_retry_delay(),
            receipt_timeout: config.receipt_timeout(),
            receipt_poll_interval: config.receipt_poll_interval(),
            authorize_gas_limit_floor: config.authorize_gas_limit_floor,
            gas_limit_buffer: config.gas_limit_buffer,
            fee_token,
        })
    }
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self {
            chain_id: config.chain_id,
            fee_policy: config.fee_policy(),
            max_underpriced_retries: config.max_underpriced_retries,
            max_transient_retries: config.max_transient_retries,
            transient_retry_delay: config.transient_retry_delay(),
            receipt_timeout: config.receipt_timeout(),
            receipt_poll_interval: config.receipt_poll_interval(),
            authorize_gas_limit_floor: config.authorize_gas_limit_floor,
            gas_limit_buffer: config.gas_limit_buffer,
            fee_token: None,
        }
    }
}

// ============================================================================
// Alias Cleanup Guard
// ============================================================================

/// Deletes a generated key alias unless disarmed. Dropping an armed guard
/// (a cancelled future) schedules the deletion on the current runtime.
struct AliasCleanup {
    keystore: Arc<dyn SecureKeyStore>,
    alias: Option<String>,
}

impl AliasCleanup {
    fn new(keystore: Arc<dyn SecureKeyStore>, alias: &str) -> Self {
        Self {
            keystore,
            alias: Some(alias.to_string()),
        }
    }

    fn disarm(&mut self) {
        self.alias = None;
    }

    async fn run(mut self) {
        if let Some(alias) = self.alias.take() {
            match self.keystore.delete_alias(&alias).await {
                Ok(()) => debug!(alias = %alias, "deleted undelegated session key"),
                Err(e) => warn!(alias = %alias, error = %e, "failed to delete undelegated session key"),
            }
        }
    }
}

impl Drop for AliasCleanup {
    fn drop(&mut self) {
        let Some(alias) = self.alias.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let keystore = self.keystore.clone();
                handle.spawn(async move {
                    if let Err(e) = keystore.delete_alias(&alias).await {
                        warn!(alias = %alias, error = %e, "failed to delete abandoned session key");
                    }
                });
            }
            Err(_) => warn!(alias = %alias, "no runtime to delete abandoned session key"),
        }
    }
}

// ============================================================================
// Authorizer
// ============================================================================

pub struct SessionAuthorizer {
    sessions: SessionKeyManager,
    signer: PasskeySigner,
    rpc: Arc<dyn ChainRpc>,
    relay: Arc<dyn FeeRelay>,
    config: AuthorizerConfig,
    /// Serializes authorization flows.
    gate: Mutex<()>,
    fee_floors: FeeFloorCache,
    send_locks: AddressLocks,
    cache: RwLock<HashMap<Address, SessionKey>>,
    states: RwLock<HashMap<Address, AuthorizationState>>,
}

impl SessionAuthorizer {
    pub fn new(
        sessions: SessionKeyManager,
        signer: PasskeySigner,
        rpc: Arc<dyn ChainRpc>,
        relay: Arc<dyn FeeRelay>,
        config: AuthorizerConfig,
    ) -> Self {
        Self {
            sessions,
            signer,
            rpc,
            relay,
            config,
            gate: Mutex::new(()),
            fee_floors: FeeFloorCache::new(),
            send_locks: AddressLocks::new(),
            cache: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &SessionKeyManager {
        &self.sessions
    }

    pub fn fee_floors(&self) -> &FeeFloorCache {
        &self.fee_floors
    }

    pub async fn state(&self, owner: &Address) -> Option<AuthorizationState> {
        self.states.read().await.get(owner).cloned()
    }

    async fn set_state(&self, owner: &Address, state: AuthorizationState) {
        self.states.write().await.insert(*owner, state);
    }

    /// `Checking`, unless an authorization for `owner` is in flight.
    async fn mark_checking(&self, owner: &Address) {
        let mut states = self.states.write().await;
        if !matches!(states.get(owner), Some(AuthorizationState::Authorizing { .. })) {
            states.insert(*owner, AuthorizationState::Checking);
        }
    }

    // ------------------------------------------------------------------------
    // ensure_session_key
    // ------------------------------------------------------------------------

    /// A valid session key for `account`, delegating a new one if needed.
    pub async fn ensure_session_key(&self, account: &PasskeyAccount) -> Result<SessionKey, AuthorizeError> {
        let owner = account.address;
        if let Some(key) = self.usable_key(&owner).await? {
            return Ok(key);
        }

        let _gate = self.gate.lock().await;
        // Another caller may have finished while we waited.
        if let Some(key) = self.usable_key(&owner).await? {
            return Ok(key);
        }

        match self.authorize(account).await {
            Ok(key) => {
                self.cache.write().await.insert(owner, key.clone());
                self.set_state(&owner, AuthorizationState::Ready {
                    expires_at: key.expires_at,
                })
                .await;
                info!(owner = %owner, session = %key.address, expires_at = key.expires_at, "session key ready");
                Ok(key)
            }
            Err(err) => {
                if !matches!(err.source, EngineError::UserCancelled) {
                    warn!(owner = %owner, stage = %err.stage, error = %err.source, "session authorization failed");
                }
                self.set_state(&owner, AuthorizationState::Failed {
                    stage: err.stage,
                    reason: err.source.to_string(),
                })
                .await;
                Err(err)
            }
        }
    }

    /// Cached or saved key that passes `is_valid` right now. Keys that fail
    /// the check are deleted.
    async fn usable_key(&self, owner: &Address) -> Result<Option<SessionKey>, AuthorizeError> {
        let owner_hex = format!("{owner:#x}");
        let cached = self.cache.read().await.get(owner).cloned();
        let candidate = match cached {
            Some(key) => Some(key),
            None => {
                self.mark_checking(owner).await;
                self.sessions
                    .load(owner)
                    .await
                    .map_err(|e| AuthorizeError::new(AuthStage::Check, e))?
            }
        };
        let Some(key) = candidate else {
            return Ok(None);
        };

        if self.sessions.is_valid(&key, &owner_hex).await {
            self.cache.write().await.insert(*owner, key.clone());
            self.set_state(owner, AuthorizationState::Ready {
                expires_at: key.expires_at,
            })
            .await;
            return Ok(Some(key));
        }

        info!(owner = %owner, session = %key.address, "discarding unusable session key");
        self.cache.write().await.remove(owner);
        self.sessions
            .delete(&key)
            .await
            .map_err(|e| AuthorizeError::new(AuthStage::Check, e))?;
        Ok(None)
    }

    async fn authorize(&self, account: &PasskeyAccount) -> Result<SessionKey, AuthorizeError> {
        let owner = account.address;
        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Generate,
        })
        .await;
        let mut key = self
            .sessions
            .generate(&owner)
            .await
            .map_err(|e| AuthorizeError::new(AuthStage::Generate, e))?;

        let mut cleanup = AliasCleanup::new(self.sessions.keystore(), &key.alias);
        match self.delegate(account, &mut key).await {
            Ok(()) => {
                cleanup.disarm();
                Ok(key)
            }
            Err(e) => {
                cleanup.run().await;
                Err(e)
            }
        }
    }

    /// Steps after key generation: delegation signature, authorizing
    /// transaction, receipt, persistence.
    async fn delegate(&self, account: &PasskeyAccount, key: &mut SessionKey) -> Result<(), AuthorizeError> {
        let owner = account.address;
        let stage = |stage: AuthStage| move |e: EngineError| AuthorizeError::new(stage, e);

        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Delegate,
        })
        .await;
        let digest = self.sessions.build_authorization_digest(key);
        let assertion = self
            .signer
            .sign(&digest, account)
            .await
            .map_err(stage(AuthStage::Delegate))?;
        let payload = self.sessions.build_delegation_payload(key, &assertion);

        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Quote,
        })
        .await;
        let send_guard = self.send_locks.acquire(&owner).await;
        let nonce = self
            .rpc_with_retry(|| self.rpc.get_nonce(&owner, BlockTag::Pending))
            .await
            .map_err(stage(AuthStage::Quote))?;
        let quote = self.quote(&owner).await.map_err(stage(AuthStage::Quote))?;
        let floor = self.config.authorize_gas_limit_floor;
        let gas_limit = self
            .estimate_gas_limit(&[GasEstimateRequest::new(&owner, &owner, &[])], floor, floor)
            .await
            .map_err(stage(AuthStage::Quote))?;
        debug!(owner = %owner, nonce, gas_limit, "quoted authorization transaction");

        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Submit,
        })
        .await;
        let template = UnsignedTransaction {
            chain_id: self.config.chain_id,
            max_priority_fee_per_gas: quote.max_priority_fee_per_gas,
            max_fee_per_gas: quote.max_fee_per_gas,
            gas_limit,
            calls: vec![Call::new(owner, U256::ZERO, Bytes::new())],
            nonce_key: NonceKey::Sequence(0),
            nonce,
            valid_before: None,
            valid_after: None,
            fee_mode: FeeMode::Sponsored,
            fee_token: None,
            key_authorization: Some(payload.clone()),
        };
        let (tx_hash, _) = self
            .submit_with_retry(&owner, quote, FeeMode::Sponsored, |q| {
                let tx = with_fees(&template, q);
                async move {
                    let assertion = self.signer.sign(&tx.signature_hash(), account).await?;
                    Ok::<_, EngineError>(tx.into_signed(assertion.to_scheme_signature()))
                }
            })
            .await
            .map_err(stage(AuthStage::Submit))?;
        drop(send_guard);
        info!(owner = %owner, tx_hash = %tx_hash, "submitted session key authorization");

        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Receipt,
        })
        .await;
        self.await_receipt(&tx_hash)
            .await
            .map_err(stage(AuthStage::Receipt))?;

        self.set_state(&owner, AuthorizationState::Authorizing {
            stage: AuthStage::Persist,
        })
        .await;
        key.key_authorization = Some(payload);
        self.sessions.persist(key).await.map_err(stage(AuthStage::Persist))?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Fees and submission
    // ------------------------------------------------------------------------

    /// Fresh quote raised to the remembered floor for `sender`.
    async fn quote(&self, sender: &Address) -> Result<FeeQuote, EngineError> {
        let gas_price = self.rpc_with_retry(|| self.rpc.gas_price()).await?;
        let fresh = FeeQuote::from_gas_price(gas_price, &self.config.fee_policy);
        Ok(self.fee_floors.merge(sender, fresh).await)
    }

    /// Read-only RPC call with the transient retry budget.
    async fn rpc_with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.config.max_transient_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "retrying rpc call");
                    tokio::time::sleep(self.config.transient_retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn submit(&self, signed: &SignedTransaction, sender: &Address, fee_mode: FeeMode) -> Result<String, RpcError> {
        match fee_mode {
            FeeMode::Sponsored => {
                let hinted = append_sender_hint(&signed.to_hex(), sender);
                let cosigned = self.relay.sign_raw_transaction(&hinted).await?;
                self.rpc.send_raw_transaction(&cosigned).await
            }
            FeeMode::SelfPay => self.rpc.send_raw_transaction(&signed.to_hex()).await,
        }
    }

    /// Build, sign and submit; on an underpriced rejection bump fees, raise
    /// the floor and try again. Returns the transaction hash and the fees
    /// that were accepted.
    async fn submit_with_retry<B, Fut>(
        &self,
        sender: &Address,
        mut quote: FeeQuote,
        fee_mode: FeeMode,
        mut build: B,
    ) -> Result<(String, FeeQuote), EngineError>
    where
        B: FnMut(FeeQuote) -> Fut,
        Fut: Future<Output = Result<SignedTransaction, EngineError>>,
    {
        let mut bumps = 0u32;
        let mut transient = 0u32;
        let mut signed = build(quote).await?;
        loop {
            match self.submit(&signed, sender, fee_mode).await {
                Ok(tx_hash) => return Ok((tx_hash, quote)),
                Err(e) if e.is_underpriced() => {
                    if bumps >= self.config.max_underpriced_retries {
                        return Err(EngineError::UnderpricedRetryExhausted {
                            attempts: bumps + 1,
                            last_error: e.to_string(),
                        });
                    }
                    bumps += 1;
                    quote = self.fee_floors.bump(sender, quote, &self.config.fee_policy).await;
                    warn!(
                        sender = %sender,
                        attempt = bumps,
                        priority = quote.max_priority_fee_per_gas,
                        max_fee = quote.max_fee_per_gas,
                        "fees rejected as underpriced, resubmitting"
                    );
                    signed = build(quote).await?;
                }
                Err(e) if e.is_transient() && transient < self.config.max_transient_retries => {
                    transient += 1;
                    debug!(sender = %sender, attempt = transient, error = %e, "transient submit error");
                    tokio::time::sleep(self.config.transient_retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll until a receipt appears. When the timeout passes but the node
    /// knows the transaction, wait one more timeout period.
    pub async fn await_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, EngineError> {
        let mut deadline = Instant::now() + self.config.receipt_timeout;
        let mut extended = false;
        loop {
            match self.rpc.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.is_success() => return Ok(receipt),
                Ok(Some(receipt)) => {
                    return Err(EngineError::RevertedOnChain {
                        tx_hash: tx_hash.to_string(),
                        status: receipt.status,
                    })
                }
                Ok(None) => {}
                Err(e) if e.is_transient() => debug!(tx_hash = %tx_hash, error = %e, "receipt poll failed"),
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                if !extended && self.transaction_known(tx_hash).await {
                    extended = true;
                    deadline = Instant::now() + self.config.receipt_timeout;
                    info!(tx_hash = %tx_hash, "transaction pending past timeout, extending wait");
                    continue;
                }
                return Err(EngineError::ReceiptTimeout {
                    tx_hash: tx_hash.to_string(),
                });
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    async fn transaction_known(&self, tx_hash: &str) -> bool {
        match self.rpc.get_transaction_by_hash(tx_hash).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(tx_hash = %tx_hash, error = %e, "transaction lookup failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session key transactions
    // ------------------------------------------------------------------------

    /// Encoded keychain signature over `digest`. The key must still be valid
    /// for its owner.
    pub async fn sign_with_session_key(&self, key: &SessionKey, digest: &[u8; 32]) -> Result<Vec<u8>, EngineError> {
        self.require_valid(key).await?;
        Ok(self.sessions.sign_transaction(key, digest).await?.encode())
    }

    async fn require_valid(&self, key: &SessionKey) -> Result<(), EngineError> {
        if self.sessions.is_valid(key, &format!("{:#x}", key.owner)).await {
            Ok(())
        } else {
            self.cache.write().await.remove(&key.owner);
            Err(EngineError::InvalidSessionKey(format!(
                "session key {} expired or no longer held",
                key.address
            )))
        }
    }

    /// Summed estimate plus buffer, at least `minimum`. When the node
    /// rejects an estimate (reverting call, malformed answer) the limit is
    /// `fallback`; transport failures still propagate.
    async fn estimate_gas_limit(&self, requests: &[GasEstimateRequest], minimum: u64, fallback: u64) -> Result<u64, EngineError> {
        let mut total = 0u64;
        for request in requests {
            match self.rpc_with_retry(|| self.rpc.estimate_gas(request)).await {
                Ok(gas) => total = total.saturating_add(gas),
                Err(EngineError::Transient(msg)) => return Err(EngineError::Transient(msg)),
                Err(err) => {
                    warn!(to = %request.to, gas_limit = fallback, error = %err, "eth_estimateGas failed; using minimum gas limit");
                    return Ok(fallback);
                }
            }
        }
        Ok(total.saturating_add(self.config.gas_limit_buffer).max(minimum))
    }

    async fn estimate_calls(&self, sender: &Address, calls: &[Call]) -> Result<u64, EngineError> {
        let requests: Vec<GasEstimateRequest> = calls
            .iter()
            .map(|call| GasEstimateRequest::new(sender, &call.to, &call.input))
            .collect();
        self.estimate_gas_limit(&requests, 0, self.config.authorize_gas_limit_floor)
            .await
    }

    async fn unsigned_for(&self, key: &SessionKey, calls: Vec<Call>, fee_mode: FeeMode) -> Result<(UnsignedTransaction, FeeQuote), EngineError> {
        let owner = key.owner;
        let nonce = self
            .rpc_with_retry(|| self.rpc.get_nonce(&owner, BlockTag::Pending))
            .await?;
        let quote = self.quote(&owner).await?;
        let gas_limit = self.estimate_calls(&owner, &calls).await?;
        let tx = UnsignedTransaction {
            chain_id: self.config.chain_id,
            max_priority_fee_per_gas: quote.max_priority_fee_per_gas,
            max_fee_per_gas: quote.max_fee_per_gas,
            gas_limit,
            calls,
            nonce_key: NonceKey::Sequence(0),
            nonce,
            valid_before: None,
            valid_after: None,
            fee_mode,
            fee_token: self.config.fee_token,
            key_authorization: None,
        };
        Ok((tx, quote))
    }

    async fn sign_unsigned(&self, key: &SessionKey, tx: UnsignedTransaction) -> Result<SignedTransaction, EngineError> {
        let signature: SchemeSignature = self.sessions.sign_transaction(key, &tx.signature_hash()).await?;
        Ok(tx.into_signed(signature))
    }

    /// Session-key-signed transaction for `calls` at the current nonce and fees.
    pub async fn build_and_sign(&self, key: &SessionKey, calls: Vec<Call>, fee_mode: FeeMode) -> Result<SignedTransaction, EngineError> {
        self.require_valid(key).await?;
        let _send = self.send_locks.acquire(&key.owner).await;
        let (tx, _) = self.unsigned_for(key, calls, fee_mode).await?;
        self.sign_unsigned(key, tx).await
    }

    /// Hint, co-sign through the relay and broadcast an already signed transaction.
    pub async fn submit_sponsored(&self, signed: &SignedTransaction, sender: &Address) -> Result<String, EngineError> {
        Ok(self.submit(signed, sender, FeeMode::Sponsored).await?)
    }

    /// Build, sign, submit with fee retry and wait for the receipt.
    pub async fn send_with_session_key(&self, key: &SessionKey, calls: Vec<Call>, fee_mode: FeeMode) -> Result<TransactionReceipt, EngineError> {
        self.require_valid(key).await?;
        let owner = key.owner;
        let tx_hash = {
            let _send = self.send_locks.acquire(&owner).await;
            let (template, quote) = self.unsigned_for(key, calls, fee_mode).await?;
            let (tx_hash, _) = self
                .submit_with_retry(&owner, quote, fee_mode, |q| self.sign_unsigned(key, with_fees(&template, q)))
                .await?;
            tx_hash
        };
        info!(owner = %owner, tx_hash = %tx_hash, "submitted session key transaction");
        self.await_receipt(&tx_hash).await
    }

    /// Forget and delete the session key of `owner`.
    pub async fn revoke(&self, owner: &Address) -> Result<(), EngineError> {
        let _gate = self.gate.lock().await;
        let cached = self.cache.write().await.remove(owner);
        let key = match cached {
            Some(key) => Some(key),
            None => self.sessions.load(owner).await?,
        };
        if let Some(key) = key {
            self.sessions.delete(&key).await?;
        }
        self.states.write().await.remove(owner);
        Ok(())
    }
}

fn with_fees(template: &UnsignedTransaction, quote: FeeQuote) -> UnsignedTransaction {
    let mut tx = template.clone();
    tx.max_priority_fee_per_gas = quote.max_priority_fee_per_gas;
    tx.max_fee_per_gas = quote.max_fee_per_gas;
    tx
}
