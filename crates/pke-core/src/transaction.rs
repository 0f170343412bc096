//! Encoder for the account-abstraction transaction type `0x76`.
//!
//! Field order (signing payload and final encoding):
//!
//! | # | field                  | notes                                        |
//! |---|------------------------|----------------------------------------------|
//! | 0 | chain_id               |                                              |
//! | 1 | max_priority_fee       |                                              |
//! | 2 | max_fee                |                                              |
//! | 3 | gas_limit              |                                              |
//! | 4 | calls                  | list of `[to, value, input]`                 |
//! | 5 | access_list            | always empty                                 |
//! | 6 | nonce_key              |                                              |
//! | 7 | nonce                  |                                              |
//! | 8 | valid_before           | empty string when unset                      |
//! | 9 | valid_after            | empty string when unset                      |
//! |10 | fee_token              | empty placeholder when sponsored             |
//! |11 | fee_payer_signature    | `0x00` when sponsored, empty when self-pay   |
//! |12 | aa_authorization_list  | always empty                                 |
//! |13 | key_authorization      | pre-encoded, only when present               |
//!
//! The final encoding appends the scheme signature bytes as one more field.

use alloy_primitives::{Address, U256};
use bytes::Bytes;

use pke_crypto::hash::keccak256;
use pke_crypto::rlp::{encode_list, trim_leading_zeros, Item};
use pke_crypto::signature::SchemeSignature;

use crate::errors::EngineError;

pub const TX_TYPE: u8 = 0x76;

/// Suffix the fee relay expects after `<tx><sender>`.
pub const SENDER_HINT_MARKER: [u8; 6] = [0xfe, 0xef, 0xee, 0xfe, 0xef, 0xee];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

impl Call {
    pub fn new(to: Address, value: U256, input: impl Into<Bytes>) -> Self {
        Self {
            to,
            value,
            input: input.into(),
        }
    }

    fn to_item(&self) -> Item {
        Item::List(vec![
            Item::address(&self.to),
            Item::u256(self.value),
            Item::bytes(self.input.to_vec()),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeMode {
    SelfPay,
    Sponsored,
}

/// 2D nonce key. Both forms encode through the same minimal byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceKey {
    Sequence(u64),
    /// Big-endian bytes, at most 32.
    Raw(Vec<u8>),
}

impl NonceKey {
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        if trim_leading_zeros(bytes).len() > 32 {
            return Err(EngineError::Protocol(format!(
                "nonce key wider than 32 bytes ({})",
                bytes.len()
            )));
        }
        Ok(NonceKey::Raw(bytes.to_vec()))
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            NonceKey::Sequence(n) => trim_leading_zeros(&n.to_be_bytes()).to_vec(),
            NonceKey::Raw(b) => trim_leading_zeros(b).to_vec(),
        }
    }

    fn to_item(&self) -> Item {
        Item::Bytes(self.canonical_bytes())
    }
}

impl Default for NonceKey {
    fn default() -> Self {
        NonceKey::Sequence(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub calls: Vec<Call>,
    pub nonce_key: NonceKey,
    pub nonce: u64,
    pub valid_before: Option<u64>,
    pub valid_after: Option<u64>,
    pub fee_mode: FeeMode,
    pub fee_token: Option<Address>,
    /// Pre-encoded delegation payload.
    pub key_authorization: Option<Bytes>,
}

impl UnsignedTransaction {
    pub fn signing_fields(&self) -> Vec<Item> {
        let optional_uint = |v: Option<u64>| v.map(Item::uint).unwrap_or_else(Item::empty);

        let (fee_token, fee_payer_signature) = match self.fee_mode {
            FeeMode::Sponsored => (Item::empty(), Item::bytes(vec![0x00])),
            FeeMode::SelfPay => (
                self.fee_token
                    .as_ref()
                    .map(Item::address)
                    .unwrap_or_else(Item::empty),
                Item::empty(),
            ),
        };

        let mut fields = vec![
            Item::uint(self.chain_id),
            Item::uint128(self.max_priority_fee_per_gas),
            Item::uint128(self.max_fee_per_gas),
            Item::uint(self.gas_limit),
            Item::List(self.calls.iter().map(Call::to_item).collect()),
            Item::empty_list(),
            self.nonce_key.to_item(),
            Item::uint(self.nonce),
            optional_uint(self.valid_before),
            optional_uint(self.valid_after),
            fee_token,
            fee_payer_signature,
            Item::empty_list(),
        ];
        if let Some(auth) = &self.key_authorization {
            fields.push(Item::Raw(auth.to_vec()));
        }
        fields
    }

    /// `0x76 ‖ encode_list(signing_fields)`
    pub fn signing_payload(&self) -> Vec<u8> {
        let body = encode_list(&self.signing_fields());
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(TX_TYPE);
        out.extend_from_slice(&body);
        out
    }

    pub fn signature_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    pub fn into_signed(self, signature: SchemeSignature) -> SignedTransaction {
        SignedTransaction {
            tx: self,
            signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    pub signature: SchemeSignature,
}

impl SignedTransaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut fields = self.tx.signing_fields();
        fields.push(Item::bytes(self.signature.encode()));
        let body = encode_list(&fields);
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(TX_TYPE);
        out.extend_from_slice(&body);
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.encode()))
    }

    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.encode())
    }
}

/// `<tx hex><sender hex>feefeefeefee`, the form the fee relay co-signs.
pub fn append_sender_hint(signed_hex: &str, sender: &Address) -> String {
    format!(
        "0x{}{}{}",
        signed_hex.trim_start_matches("0x"),
        hex::encode(sender.as_slice()),
        hex::encode(SENDER_HINT_MARKER)
    )
}
