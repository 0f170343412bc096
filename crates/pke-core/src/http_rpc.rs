#![cfg(feature = "http-rpc")]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::Address;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::rpc::{
    hex_string_from_value, optional_record, quantity_from_value, u64_from_value, BlockTag, ChainRpc,
    FeeRelay, GasEstimateRequest, JsonRpcRequest, JsonRpcResponse, RpcError, TransactionReceipt,
    TransactionSummary,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// JSON-RPC 2.0 over HTTP. One client serves either a chain node or a fee relay.
#[derive(Debug)]
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One call. Error objects become [`RpcError::Rejected`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!(url = %self.url, method, id, "json-rpc call");

        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        decode_response(method, status, &body)
    }

    async fn request(&self, (method, params): (&'static str, Value)) -> Result<Value, RpcError> {
        self.call(method, params).await
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

fn chain_id_request() -> (&'static str, Value) {
    ("eth_chainId", json!([]))
}

fn nonce_request(address: &Address, tag: BlockTag) -> (&'static str, Value) {
    ("eth_getTransactionCount", json!([format!("{address:#x}"), tag.as_str()]))
}

fn gas_price_request() -> (&'static str, Value) {
    ("eth_gasPrice", json!([]))
}

fn estimate_gas_request(request: &GasEstimateRequest) -> (&'static str, Value) {
    ("eth_estimateGas", json!([request]))
}

fn send_raw_request(signed_hex: &str) -> (&'static str, Value) {
    ("eth_sendRawTransaction", json!([signed_hex]))
}

fn receipt_request(tx_hash: &str) -> (&'static str, Value) {
    ("eth_getTransactionReceipt", json!([tx_hash]))
}

fn by_hash_request(tx_hash: &str) -> (&'static str, Value) {
    ("eth_getTransactionByHash", json!([tx_hash]))
}

fn sign_raw_request(hinted_hex: &str) -> (&'static str, Value) {
    ("eth_signRawTransaction", json!([hinted_hex]))
}

/// 5xx is transport trouble; any other status must carry a JSON-RPC envelope.
fn decode_response(method: &str, status: StatusCode, body: &[u8]) -> Result<Value, RpcError> {
    if status.is_server_error() {
        return Err(RpcError::Transport(format!(
            "status={} body={:?}",
            status,
            String::from_utf8_lossy(body)
        )));
    }
    let envelope: JsonRpcResponse = serde_json::from_slice(body).map_err(|e| {
        RpcError::Protocol(format!("{method}: status={status} undecodable response: {e}"))
    })?;
    envelope.into_outcome().into_result()
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        u64_from_value(&self.request(chain_id_request()).await?)
    }

    async fn get_nonce(&self, address: &Address, tag: BlockTag) -> Result<u64, RpcError> {
        u64_from_value(&self.request(nonce_request(address, tag)).await?)
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        quantity_from_value(&self.request(gas_price_request()).await?)
    }

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, RpcError> {
        u64_from_value(&self.request(estimate_gas_request(request)).await?)
    }

    async fn send_raw_transaction(&self, signed_hex: &str) -> Result<String, RpcError> {
        hex_string_from_value(&self.request(send_raw_request(signed_hex)).await?)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, RpcError> {
        optional_record(self.request(receipt_request(tx_hash)).await?)
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<TransactionSummary>, RpcError> {
        optional_record(self.request(by_hash_request(tx_hash)).await?)
    }
}

#[async_trait]
impl FeeRelay for JsonRpcClient {
    async fn sign_raw_transaction(&self, hinted_hex: &str) -> Result<String, RpcError> {
        hex_string_from_value(&self.request(sign_raw_request(hinted_hex)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::append_sender_hint;

    fn ok(body: &str) -> Result<Value, RpcError> {
        decode_response("test", StatusCode::OK, body.as_bytes())
    }

    #[test]
    fn test_request_envelope() {
        let (method, params) = chain_id_request();
        let body = serde_json::to_value(JsonRpcRequest::new(9, method, params)).unwrap();
        assert_eq!(
            body,
            json!({"jsonrpc": "2.0", "id": 9, "method": "eth_chainId", "params": []})
        );
    }

    #[test]
    fn test_nonce_uses_pending_tag() {
        let address = Address::repeat_byte(0xab);
        let (method, params) = nonce_request(&address, BlockTag::Pending);
        assert_eq!(method, "eth_getTransactionCount");
        assert_eq!(params, json!([format!("0x{}", "ab".repeat(20)), "pending"]));
    }

    #[test]
    fn test_estimate_gas_params() {
        let request = GasEstimateRequest::new(&Address::repeat_byte(1), &Address::repeat_byte(2), &[0xca, 0xfe]);
        let (method, params) = estimate_gas_request(&request);
        assert_eq!(method, "eth_estimateGas");
        assert_eq!(params[0]["from"], format!("0x{}", "01".repeat(20)));
        assert_eq!(params[0]["to"], format!("0x{}", "02".repeat(20)));
        assert_eq!(params[0]["data"], "0xcafe");
        assert!(params[0].get("value").is_none());

        let (_, empty) = estimate_gas_request(&GasEstimateRequest::new(&Address::ZERO, &Address::ZERO, &[]));
        assert!(empty[0].get("data").is_none());
    }

    #[test]
    fn test_transaction_methods() {
        assert_eq!(gas_price_request(), ("eth_gasPrice", json!([])));
        assert_eq!(send_raw_request("0x76c0"), ("eth_sendRawTransaction", json!(["0x76c0"])));
        assert_eq!(receipt_request("0x01"), ("eth_getTransactionReceipt", json!(["0x01"])));
        assert_eq!(by_hash_request("0x01"), ("eth_getTransactionByHash", json!(["0x01"])));
    }

    #[test]
    fn test_relay_receives_hinted_payload() {
        let sender = Address::repeat_byte(0x11);
        let hinted = append_sender_hint("0x76c0", &sender);
        let (method, params) = sign_raw_request(&hinted);
        assert_eq!(method, "eth_signRawTransaction");
        assert_eq!(
            params,
            json!([format!("0x76c0{}feefeefeefee", "11".repeat(20))])
        );
    }

    #[test]
    fn test_decode_result() {
        let v = ok(r#"{"jsonrpc":"2.0","id":1,"result":"0x1a"}"#).unwrap();
        assert_eq!(u64_from_value(&v).unwrap(), 26);

        let none = ok(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(optional_record::<TransactionReceipt>(none).unwrap(), None);
    }

    #[test]
    fn test_error_object_is_rejected() {
        let err = ok(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"transaction underpriced"}}"#)
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::Rejected {
                code: -32000,
                message: "transaction underpriced".into()
            }
        );
        assert!(err.is_underpriced());
        assert!(!err.is_transient());

        let revert = ok(r#"{"jsonrpc":"2.0","id":1,"error":{"code":3,"message":"execution reverted"}}"#)
            .unwrap_err();
        assert!(!revert.is_underpriced());
    }

    #[test]
    fn test_server_error_is_transient() {
        let err = decode_response("eth_gasPrice", StatusCode::BAD_GATEWAY, b"upstream down").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_undecodable_body_is_protocol_error() {
        let err = decode_response("eth_gasPrice", StatusCode::OK, b"<html>").unwrap_err();
        assert!(matches!(err, RpcError::Protocol(ref m) if m.starts_with("eth_gasPrice")));
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = JsonRpcClient::new("https://rpc.example/").unwrap();
        assert_eq!(client.url(), "https://rpc.example");
    }
}
