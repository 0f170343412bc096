//! Chain RPC and fee relay capabilities, plus the JSON-RPC records they use.
//!
//! Every method has an explicit request/response shape. Responses are parsed
//! strictly: a missing or malformed field is [`RpcError::Protocol`], never a
//! silently defaulted value.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Connection reset, timeout, 5xx. Safe to retry at the same fees.
    #[error("transport error: {0}")]
    Transport(String),

    /// Node or relay answered with a JSON-RPC error object.
    #[error("rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

const UNDERPRICED_MARKERS: [&str; 4] = [
    "underpriced",
    "fee too low",
    "max fee per gas less than block base fee",
    "replacement transaction",
];

impl RpcError {
    /// Rejection that a higher fee bid may clear.
    pub fn is_underpriced(&self) -> bool {
        match self {
            RpcError::Rejected { message, .. } => {
                let lower = message.to_ascii_lowercase();
                UNDERPRICED_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    /// `0x1` on success.
    pub status: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
}

impl TransactionReceipt {
    pub fn is_success(&self) -> bool {
        parse_quantity(&self.status).map(|v| v == 1).unwrap_or(false)
    }
}

/// The subset of `eth_getTransactionByHash` the engine looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub hash: String,
    #[serde(default)]
    pub block_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimateRequest {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl GasEstimateRequest {
    pub fn new(from: &Address, to: &Address, data: &[u8]) -> Self {
        Self {
            from: format!("{from:#x}"),
            to: format!("{to:#x}"),
            data: (!data.is_empty()).then(|| format!("0x{}", hex::encode(data))),
            value: None,
        }
    }
}

// ============================================================================
// JSON-RPC Envelope
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// Two-variant outcome of one JSON-RPC call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome<T> {
    Success(T),
    Failure { code: i64, message: String },
}

impl<T> RpcOutcome<T> {
    pub fn into_result(self) -> Result<T, RpcError> {
        match self {
            RpcOutcome::Success(v) => Ok(v),
            RpcOutcome::Failure { code, message } => Err(RpcError::Rejected { code, message }),
        }
    }
}

impl JsonRpcResponse {
    /// An error object wins over a result. A response with neither carries
    /// `null` as its result.
    pub fn into_outcome(self) -> RpcOutcome<Value> {
        match (self.error, self.result) {
            (Some(err), _) => RpcOutcome::Failure {
                code: err.code,
                message: err.message,
            },
            (None, result) => RpcOutcome::Success(result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Strict Parsers
// ============================================================================

/// `0x`-prefixed hex quantity.
pub fn parse_quantity(s: &str) -> Result<u128, RpcError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Protocol(format!("quantity without 0x prefix: {s:?}")))?;
    if digits.is_empty() {
        return Err(RpcError::Protocol("empty quantity".into()));
    }
    u128::from_str_radix(digits, 16).map_err(|e| RpcError::Protocol(format!("bad quantity {s:?}: {e}")))
}

pub fn quantity_from_value(value: &Value) -> Result<u128, RpcError> {
    value
        .as_str()
        .ok_or_else(|| RpcError::Protocol(format!("expected hex string, got {value}")))
        .and_then(parse_quantity)
}

pub fn u64_from_value(value: &Value) -> Result<u64, RpcError> {
    let q = quantity_from_value(value)?;
    u64::try_from(q).map_err(|_| RpcError::Protocol(format!("quantity {q} exceeds u64")))
}

pub fn hex_string_from_value(value: &Value) -> Result<String, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::Protocol(format!("expected hex string, got {value}")))?;
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Protocol(format!("hex string without 0x prefix: {s:?}")))?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RpcError::Protocol(format!("not hex: {s:?}")));
    }
    Ok(s.to_string())
}

/// `null` is `None`; anything else must match `T` exactly.
pub fn optional_record<T: serde::de::DeserializeOwned>(value: Value) -> Result<Option<T>, RpcError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RpcError::Protocol(e.to_string()))
}

// ============================================================================
// Capabilities
// ============================================================================

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn get_nonce(&self, address: &Address, tag: BlockTag) -> Result<u64, RpcError>;

    async fn gas_price(&self) -> Result<u128, RpcError>;

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, RpcError>;

    /// Returns the transaction hash reported by the node.
    async fn send_raw_transaction(&self, signed_hex: &str) -> Result<String, RpcError>;

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, RpcError>;

    async fn get_transaction_by_hash(&self, tx_hash: &str) -> Result<Option<TransactionSummary>, RpcError>;
}

/// Fee sponsor that co-signs a transaction carrying a sender hint.
#[async_trait]
pub trait FeeRelay: Send + Sync {
    /// Takes `<tx><sender>feefeefeefee`, returns the co-signed transaction hex.
    async fn sign_raw_transaction(&self, hinted_hex: &str) -> Result<String, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_underpriced_classification() {
        let rejected = |m: &str| RpcError::Rejected {
            code: -32000,
            message: m.into(),
        };
        assert!(rejected("transaction underpriced").is_underpriced());
        assert!(rejected("Fee too low for replacement").is_underpriced());
        assert!(rejected("max fee per gas less than block base fee: 1 < 2").is_underpriced());
        assert!(rejected("replacement transaction underpriced").is_underpriced());
        assert!(!rejected("nonce too low").is_underpriced());
        assert!(!RpcError::Transport("underpriced".into()).is_underpriced());
        assert!(RpcError::Transport("reset".into()).is_transient());
    }

    #[test]
    fn test_envelope_outcome() {
        let ok: JsonRpcResponse = serde_json::from_value(json!({"jsonrpc":"2.0","id":1,"result":"0x2a"})).unwrap();
        assert_eq!(ok.into_outcome(), RpcOutcome::Success(json!("0x2a")));

        let err: JsonRpcResponse = serde_json::from_value(
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"underpriced"}}),
        )
        .unwrap();
        let outcome = err.into_outcome();
        assert!(outcome.clone().into_result().unwrap_err().is_underpriced());
        assert!(matches!(outcome, RpcOutcome::Failure { code: -32000, .. }));
    }

    #[test]
    fn test_strict_quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0xa5bf").unwrap(), 42431);
        assert!(parse_quantity("42").is_err());
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("0xzz").is_err());
        assert!(u64_from_value(&json!(7)).is_err());
        assert!(hex_string_from_value(&json!("0x12ab")).is_ok());
        assert!(hex_string_from_value(&json!("12ab")).is_err());
    }

    #[test]
    fn test_receipt_record() {
        let receipt: Option<TransactionReceipt> = optional_record(json!({
            "transactionHash": "0xab",
            "status": "0x1",
            "blockNumber": "0x10"
        }))
        .unwrap();
        assert!(receipt.unwrap().is_success());

        let none: Option<TransactionReceipt> = optional_record(Value::Null).unwrap();
        assert!(none.is_none());

        let missing_status = optional_record::<TransactionReceipt>(json!({"transactionHash": "0xab"}));
        assert!(matches!(missing_status, Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_gas_estimate_request_shape() {
        let req = GasEstimateRequest::new(&Address::repeat_byte(1), &Address::repeat_byte(1), &[]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["from"], json!(format!("0x{}", "01".repeat(20))));
        assert!(v.get("data").is_none());
    }
}
