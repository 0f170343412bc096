//! Integration tests for the session authorization flow.
//!
//! Time is paused so receipt polling and retry delays run instantly.

use std::time::Duration;

use alloy_primitives::{Address, U256};
use bytes::Bytes;
use tokio::time::Instant;

use pke_core::authorize::{AuthorizationState, AuthorizerConfig, SessionAuthorizer};
use pke_core::errors::{AuthStage, EngineError, ErrorClass};
use pke_core::harness::{ReceiptScript, TestEnv, TEST_CHAIN_ID};
use pke_core::keystore::SecureKeyStore;
use pke_core::passkey::{AuthenticatorOutcome, PasskeySigner};
use pke_core::rpc::RpcError;
use pke_core::session_key::{SessionKeyManager, DEFAULT_SESSION_VALIDITY_SECS};
use pke_core::transaction::{Call, FeeMode};
use pke_crypto::rlp::{decode, Item};

fn decode_tx(hex_tx: &str) -> Vec<Item> {
    let bytes = hex::decode(hex_tx.trim_start_matches("0x")).unwrap();
    assert_eq!(bytes[0], 0x76);
    decode(&bytes[1..]).unwrap().as_list().unwrap().to_vec()
}

/// Test: First call mints, delegates and persists a session key
#[tokio::test(start_paused = true)]
async fn flow_authorizes_new_session_key() {
    let env = TestEnv::new();
    let account = env.account();

    let key = env.authorizer.ensure_session_key(&account).await.unwrap();

    assert_eq!(key.owner, account.address);
    assert!(key.key_authorization.is_some());
    assert_eq!(env.keystore.len().await, 1);
    // Delegation signature plus the root-signed authorizing transaction.
    assert_eq!(env.passkey.prompts(), 2);
    assert_eq!(
        env.authorizer.state(&account.address).await,
        Some(AuthorizationState::Ready {
            expires_at: key.expires_at
        })
    );

    let hinted = env.relay.hinted().await;
    assert_eq!(hinted.len(), 1);
    assert!(hinted[0].ends_with(&format!(
        "{}feefeefeefee",
        hex::encode(account.address.as_slice())
    )));

    let sent = env.rpc.sent().await;
    assert_eq!(sent.len(), 1);
    let fields = decode_tx(&sent[0]);
    assert_eq!(fields.len(), 15);
    assert_eq!(fields[0].as_u64().unwrap(), TEST_CHAIN_ID);
    assert!(fields[3].as_u64().unwrap() >= 650_000);
    assert_eq!(fields[7].as_u64().unwrap(), 7);
    assert_eq!(fields[11].as_bytes().unwrap(), &[0x00]);

    let call = fields[4].as_list().unwrap()[0].as_list().unwrap().to_vec();
    assert_eq!(call[0].as_bytes().unwrap(), account.address.as_slice());
    assert!(call[1].as_bytes().unwrap().is_empty());

    let delegation = pke_crypto::rlp::encode(&fields[13]);
    assert_eq!(Some(Bytes::from(delegation)), key.key_authorization);
    assert_eq!(fields[14].as_bytes().unwrap()[0], 0x02);

    let saved = env.authorizer.sessions().load(&account.address).await.unwrap();
    assert_eq!(saved, Some(key));
}

/// Test: A valid key is reused without prompts or network
#[tokio::test(start_paused = true)]
async fn flow_reuses_valid_key() {
    let env = TestEnv::new();
    let account = env.account();

    let first = env.authorizer.ensure_session_key(&account).await.unwrap();
    let second = env.authorizer.ensure_session_key(&account).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(env.passkey.prompts(), 2);
    assert_eq!(env.relay.hinted().await.len(), 1);
}

/// Test: A fresh service instance picks up the saved key
#[tokio::test(start_paused = true)]
async fn flow_loads_saved_key_after_restart() {
    let env = TestEnv::new();
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();

    let sessions = SessionKeyManager::new(env.keystore.clone(), env.store.clone(), env.clock.clone(), TEST_CHAIN_ID);
    let restarted = SessionAuthorizer::new(
        sessions,
        PasskeySigner::new(env.passkey.clone()),
        env.rpc.clone(),
        env.relay.clone(),
        Default::default(),
    );
    assert_eq!(restarted.ensure_session_key(&account).await.unwrap(), key);
    assert_eq!(env.passkey.prompts(), 2);
}

/// Test: Three underpriced rejections bump fees above the floor each time
#[tokio::test(start_paused = true)]
async fn flow_underpriced_retries_then_succeeds() {
    let env = TestEnv::new();
    let account = env.account();
    env.relay.push_underpriced(3).await;

    env.authorizer.ensure_session_key(&account).await.unwrap();

    let fees = env.relay.submitted_fees().await;
    assert_eq!(fees.len(), 4);
    for pair in fees.windows(2) {
        let (prev_prio, prev_max) = pair[0];
        let (prio, max) = pair[1];
        assert!(prio > prev_prio);
        assert!(max >= prev_max + 1_000_000);
    }
    let floor = env.authorizer.fee_floors().floor(&account.address).await.unwrap();
    let (last_prio, last_max) = *fees.last().unwrap();
    assert_eq!(floor.max_priority_fee_per_gas, last_prio as u128);
    assert_eq!(floor.max_fee_per_gas, last_max as u128);
    // Every resubmission is root-signed again.
    assert_eq!(env.passkey.prompts(), 5);
}

/// Test: A fresh quote never underbids the remembered floor
#[tokio::test(start_paused = true)]
async fn flow_quote_respects_floor_after_price_drop() {
    let env = TestEnv::new();
    let account = env.account();
    env.relay.push_underpriced(2).await;
    env.authorizer.ensure_session_key(&account).await.unwrap();
    let floor = env.authorizer.fee_floors().floor(&account.address).await.unwrap();

    *env.rpc.gas_price.lock().await = 1;
    env.authorizer.revoke(&account.address).await.unwrap();
    env.authorizer.ensure_session_key(&account).await.unwrap();

    let (prio, max) = *env.relay.submitted_fees().await.last().unwrap();
    assert!(prio as u128 >= floor.max_priority_fee_per_gas);
    assert!(max as u128 >= floor.max_fee_per_gas);
}

/// Test: A fourth rejection surfaces UnderpricedRetryExhausted
#[tokio::test(start_paused = true)]
async fn flow_underpriced_budget_exhausted() {
    let env = TestEnv::new();
    let account = env.account();
    env.relay.push_underpriced(4).await;

    let err = env.authorizer.ensure_session_key(&account).await.unwrap_err();
    assert_eq!(err.stage, AuthStage::Submit);
    assert!(matches!(
        err.source,
        EngineError::UnderpricedRetryExhausted { attempts: 4, .. }
    ));
    assert_eq!(env.relay.hinted().await.len(), 4);
    assert!(env.rpc.sent().await.is_empty());
    assert!(env.keystore.is_empty().await);
    assert!(matches!(
        env.authorizer.state(&account.address).await,
        Some(AuthorizationState::Failed {
            stage: AuthStage::Submit,
            ..
        })
    ));
    assert!(err.to_string().contains("submitting authorization"));
}

/// Test: Receipt timeout with a known transaction extends exactly once
#[tokio::test(start_paused = true)]
async fn flow_receipt_timeout_extends_once() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::Never).await;
    env.rpc.set_known_by_hash(true).await;

    let started = Instant::now();
    let err = env.authorizer.ensure_session_key(&account).await.unwrap_err();

    assert_eq!(err.stage, AuthStage::Receipt);
    assert!(matches!(err.source, EngineError::ReceiptTimeout { .. }));
    assert_eq!(err.class(), ErrorClass::Retry);
    assert_eq!(env.rpc.by_hash_calls(), 1);
    assert!(started.elapsed() >= Duration::from_secs(90));
    assert!(started.elapsed() < Duration::from_secs(95));
    assert!(env.keystore.is_empty().await);
}

/// Test: An unknown transaction times out without extension
#[tokio::test(start_paused = true)]
async fn flow_receipt_timeout_unknown_transaction() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::Never).await;
    env.rpc.set_known_by_hash(false).await;

    let started = Instant::now();
    let err = env.authorizer.ensure_session_key(&account).await.unwrap_err();

    assert!(matches!(err.source, EngineError::ReceiptTimeout { .. }));
    assert_eq!(env.rpc.by_hash_calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(50));
}

/// Test: A receipt arriving during the extension succeeds
#[tokio::test(start_paused = true)]
async fn flow_receipt_arrives_during_extension() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::AfterPolls(45)).await;

    env.authorizer.ensure_session_key(&account).await.unwrap();
    assert_eq!(env.rpc.by_hash_calls(), 1);
    assert_eq!(env.rpc.receipt_polls(), 46);
}

/// Test: A reverted authorization is fatal and cleans up
#[tokio::test(start_paused = true)]
async fn flow_reverted_on_chain() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::Revert).await;

    let err = env.authorizer.ensure_session_key(&account).await.unwrap_err();
    assert!(matches!(
        err.source,
        EngineError::RevertedOnChain { ref status, .. } if status == "0x0"
    ));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(env.rpc.receipt_polls(), 1);
    assert!(env.keystore.is_empty().await);
    assert!(env.authorizer.sessions().load(&account.address).await.unwrap().is_none());
}

/// Test: Cancelling the passkey prompt is silent and leaves no key behind
#[tokio::test(start_paused = true)]
async fn flow_user_cancel_cleans_up() {
    let env = TestEnv::new();
    let account = env.account();
    env.passkey.push_outcome(AuthenticatorOutcome::Cancelled).await;

    let err = env.authorizer.ensure_session_key(&account).await.unwrap_err();
    assert_eq!(err.stage, AuthStage::Delegate);
    assert!(matches!(err.source, EngineError::UserCancelled));
    assert_eq!(err.class(), ErrorClass::Silent);
    assert!(env.keystore.is_empty().await);
    assert!(env.relay.hinted().await.is_empty());
}

/// Test: Dropping the flow mid-flight still deletes the generated alias
#[tokio::test(start_paused = true)]
async fn flow_abort_cleans_up_alias() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::Never).await;

    let authorizer = env.authorizer.clone();
    let task = tokio::spawn(async move { authorizer.ensure_session_key(&account).await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(env.keystore.len().await, 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(env.keystore.is_empty().await);
}

/// Test: Concurrent callers share one delegation
#[tokio::test(start_paused = true)]
async fn flow_concurrent_callers_single_delegation() {
    let env = TestEnv::new();
    let account = env.account();

    let a = {
        let authorizer = env.authorizer.clone();
        let account = account.clone();
        tokio::spawn(async move { authorizer.ensure_session_key(&account).await })
    };
    let b = {
        let authorizer = env.authorizer.clone();
        let account = account.clone();
        tokio::spawn(async move { authorizer.ensure_session_key(&account).await })
    };

    let key_a = a.await.unwrap().unwrap();
    let key_b = b.await.unwrap().unwrap();
    assert_eq!(key_a, key_b);
    assert_eq!(env.relay.hinted().await.len(), 1);
    assert_eq!(env.keystore.len().await, 1);
}

/// Test: After seven days the key is replaced
#[tokio::test(start_paused = true)]
async fn flow_expired_key_is_replaced() {
    let env = TestEnv::new();
    let account = env.account();
    let first = env.authorizer.ensure_session_key(&account).await.unwrap();

    env.clock.advance(DEFAULT_SESSION_VALIDITY_SECS + 1);
    let second = env.authorizer.ensure_session_key(&account).await.unwrap();

    assert_ne!(first.alias, second.alias);
    assert_eq!(env.relay.hinted().await.len(), 2);
    assert_eq!(env.keystore.len().await, 1);

    let err = env
        .authorizer
        .sign_with_session_key(&first, &[0; 32])
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Reauthorize);
}

/// Test: Ordinary transactions are signed by the session key alone
#[tokio::test(start_paused = true)]
async fn flow_send_with_session_key() {
    let env = TestEnv::new();
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();
    let prompts = env.passkey.prompts();

    let calls = vec![Call::new(Address::repeat_byte(0x42), U256::from(5u64), vec![0xab, 0xcd])];
    let receipt = env
        .authorizer
        .send_with_session_key(&key, calls.clone(), FeeMode::Sponsored)
        .await
        .unwrap();
    assert!(receipt.is_success());
    assert_eq!(env.passkey.prompts(), prompts);

    let sent = env.rpc.sent().await;
    let fields = decode_tx(sent.last().unwrap());
    assert_eq!(fields.len(), 14);
    let signature = fields[13].as_bytes().unwrap();
    assert_eq!(signature[0], 0x03);
    assert_eq!(&signature[1..21], account.address.as_slice());
    assert_eq!(signature[21], 0x01);

    let signed = env
        .authorizer
        .build_and_sign(&key, calls, FeeMode::SelfPay)
        .await
        .unwrap();
    assert_eq!(signed.tx.fee_mode, FeeMode::SelfPay);
    assert_eq!(signed.signature.type_byte(), Some(0x03));
    assert_eq!(signed.tx.gas_limit, 100_000 + 250_000);
}

/// Test: Transient relay failures are retried at the same fees
#[tokio::test(start_paused = true)]
async fn flow_transient_error_retried() {
    let env = TestEnv::new();
    let account = env.account();
    env.relay
        .push_error(RpcError::Transport("connection reset".into()))
        .await;

    env.authorizer.ensure_session_key(&account).await.unwrap();
    let fees = env.relay.submitted_fees().await;
    assert_eq!(fees.len(), 2);
    assert_eq!(fees[0], fees[1]);
    assert_eq!(env.passkey.prompts(), 2);
}

/// Test: Revocation removes the record and the key store entry
#[tokio::test(start_paused = true)]
async fn flow_revoke() {
    let env = TestEnv::new();
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();

    env.authorizer.revoke(&account.address).await.unwrap();
    assert!(env.keystore.is_empty().await);
    assert!(env.authorizer.sessions().load(&account.address).await.unwrap().is_none());
    assert!(env.authorizer.state(&account.address).await.is_none());
    assert!(matches!(
        env.authorizer.sign_with_session_key(&key, &[1; 32]).await,
        Err(EngineError::InvalidSessionKey(_))
    ));
}

/// Test: A saved record whose key store entry vanished triggers a new delegation
#[tokio::test(start_paused = true)]
async fn flow_missing_alias_reauthorizes() {
    let env = TestEnv::new();
    let account = env.account();
    let first = env.authorizer.ensure_session_key(&account).await.unwrap();

    env.keystore.delete_alias(&first.alias).await.unwrap();
    let second = env.authorizer.ensure_session_key(&account).await.unwrap();

    assert_ne!(first.address, second.address);
    assert_eq!(env.relay.hinted().await.len(), 2);
}

/// Test: A reverting gas estimate falls back to the minimum gas limit
#[tokio::test(start_paused = true)]
async fn flow_estimate_failure_uses_minimum_gas() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc
        .push_estimate_error(RpcError::Rejected {
            code: 3,
            message: "execution reverted".into(),
        })
        .await;

    let key = env.authorizer.ensure_session_key(&account).await.unwrap();
    let fields = decode_tx(&env.rpc.sent().await[0]);
    assert_eq!(fields[3].as_u64().unwrap(), 650_000);

    env.rpc
        .push_estimate_error(RpcError::Protocol("expected hex string, got null".into()))
        .await;
    let calls = vec![Call::new(Address::repeat_byte(0x42), U256::ZERO, vec![0x01])];
    let signed = env
        .authorizer
        .build_and_sign(&key, calls, FeeMode::Sponsored)
        .await
        .unwrap();
    assert_eq!(signed.tx.gas_limit, 650_000);
}

/// Test: A transport failure on the estimate is retried, not replaced by the minimum
#[tokio::test(start_paused = true)]
async fn flow_estimate_transport_error_retried() {
    let env = TestEnv::new();
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();

    env.rpc
        .push_estimate_error(RpcError::Transport("connection reset".into()))
        .await;
    let calls = vec![Call::new(Address::repeat_byte(0x42), U256::ZERO, vec![0x01])];
    let signed = env
        .authorizer
        .build_and_sign(&key, calls, FeeMode::Sponsored)
        .await
        .unwrap();
    assert_eq!(signed.tx.gas_limit, 100_000 + 250_000);
}

/// Test: Self-pay sends carry the fee token and an empty fee payer signature
#[tokio::test(start_paused = true)]
async fn flow_self_pay_with_fee_token() {
    let token = Address::repeat_byte(0x20);
    let env = TestEnv::with_config(AuthorizerConfig {
        chain_id: TEST_CHAIN_ID,
        fee_token: Some(token),
        ..AuthorizerConfig::default()
    });
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();
    let relayed = env.relay.hinted().await.len();

    env.rpc
        .push_send_error(RpcError::Rejected {
            code: -32000,
            message: "max fee per gas less than block base fee".into(),
        })
        .await;
    let calls = vec![Call::new(Address::repeat_byte(0x42), U256::ZERO, vec![0xab])];
    let receipt = env
        .authorizer
        .send_with_session_key(&key, calls, FeeMode::SelfPay)
        .await
        .unwrap();
    assert!(receipt.is_success());
    // Self-pay bypasses the relay, including on the bumped resubmission.
    assert_eq!(env.relay.hinted().await.len(), relayed);

    let sent = env.rpc.sent().await;
    let raw = sent.last().unwrap();
    let fields = decode_tx(raw);
    assert_eq!(fields.len(), 14);
    assert_eq!(fields[10].as_bytes().unwrap(), token.as_slice());
    assert!(fields[11].as_bytes().unwrap().is_empty());
    let encoded_payer_sig = pke_crypto::rlp::encode(&fields[11]);
    assert_eq!(encoded_payer_sig, vec![0x80]);

    let floor = env.authorizer.fee_floors().floor(&account.address).await.unwrap();
    assert_eq!(fields[1].as_u64().unwrap() as u128, floor.max_priority_fee_per_gas);
}

/// Test: Every relay attempt after a bump still carries the sender hint
#[tokio::test(start_paused = true)]
async fn flow_sender_hint_on_every_attempt() {
    let env = TestEnv::new();
    let account = env.account();
    let key = env.authorizer.ensure_session_key(&account).await.unwrap();
    let before = env.relay.hinted().await.len();

    env.relay.push_underpriced(2).await;
    let calls = vec![Call::new(Address::repeat_byte(0x42), U256::ZERO, vec![0xab])];
    env.authorizer
        .send_with_session_key(&key, calls, FeeMode::Sponsored)
        .await
        .unwrap();

    let hinted = env.relay.hinted().await;
    let attempts = &hinted[before..];
    assert_eq!(attempts.len(), 3);
    let suffix = format!("{}feefeefeefee", hex::encode(account.address.as_slice()));
    for attempt in attempts {
        assert!(attempt.ends_with(&suffix));
    }

    let fees = env.relay.submitted_fees().await[before..].to_vec();
    assert!(fees.windows(2).all(|w| w[1].0 > w[0].0 && w[1].1 > w[0].1));

    let fields = decode_tx(env.rpc.sent().await.last().unwrap());
    assert!(fields[10].as_bytes().unwrap().is_empty());
    assert_eq!(fields[11].as_bytes().unwrap(), &[0x00]);
}

/// Test: A waiting caller does not overwrite the in-flight stage
#[tokio::test(start_paused = true)]
async fn flow_waiting_caller_keeps_in_flight_state() {
    let env = TestEnv::new();
    let account = env.account();
    env.rpc.set_receipt(ReceiptScript::Never).await;

    let first = {
        let authorizer = env.authorizer.clone();
        let account = account.clone();
        tokio::spawn(async move { authorizer.ensure_session_key(&account).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    let in_flight = Some(AuthorizationState::Authorizing {
        stage: AuthStage::Receipt,
    });
    assert_eq!(env.authorizer.state(&account.address).await, in_flight);

    let second = {
        let authorizer = env.authorizer.clone();
        let account = account.clone();
        tokio::spawn(async move { authorizer.ensure_session_key(&account).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(env.authorizer.state(&account.address).await, in_flight);

    first.abort();
    second.abort();
}
