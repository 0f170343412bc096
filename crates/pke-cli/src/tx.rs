//! Transaction building and inspection helpers for the CLI.

use std::str::FromStr;

use alloy_primitives::{Address, U256};
use anyhow::{anyhow, bail, Context};
use serde::Serialize;

use pke_core::transaction::{Call, FeeMode, NonceKey, UnsignedTransaction, TX_TYPE};
use pke_crypto::rlp::{decode, Item};
use pke_crypto::signature::SchemeSignature;

/// Signing fields before the optional key authorization.
const SIGNING_FIELD_COUNT: usize = 13;

/// Parse `to[,value[,0xinput]]`. Value is decimal or `0x` hex wei.
pub fn parse_call(spec: &str) -> anyhow::Result<Call> {
    let mut parts = spec.splitn(3, ',');
    let to = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("call is missing a target address"))?;
    let to = Address::from_str(to.trim()).with_context(|| format!("invalid call target {to}"))?;

    let value = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
        None => U256::ZERO,
        Some(v) => match v.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16),
            None => U256::from_str_radix(v, 10),
        }
        .with_context(|| format!("invalid call value {v}"))?,
    };

    let input = match parts.next().map(str::trim).filter(|s| !s.is_empty()) {
        None => Vec::new(),
        Some(data) => decode_hex(data).context("invalid call input")?,
    };
    Ok(Call::new(to, value, input))
}

pub fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.trim();
    Ok(hex::decode(s.strip_prefix("0x").unwrap_or(s))?)
}

/// Fields accepted by `tx digest` and `tx encode`.
#[derive(Debug, Clone)]
pub struct TxSpec {
    pub chain_id: u64,
    pub nonce: u64,
    pub nonce_key: Option<String>,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub calls: Vec<String>,
    pub valid_before: Option<u64>,
    pub valid_after: Option<u64>,
    pub self_pay: bool,
    pub fee_token: Option<String>,
    pub key_authorization: Option<String>,
}

impl TxSpec {
    pub fn build(&self) -> anyhow::Result<UnsignedTransaction> {
        if self.calls.is_empty() {
            bail!("at least one --call is required");
        }
        let calls = self
            .calls
            .iter()
            .map(|c| parse_call(c))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let nonce_key = match &self.nonce_key {
            Some(k) => NonceKey::from_be_bytes(&decode_hex(k)?)?,
            None => NonceKey::default(),
        };
        let fee_token = self
            .fee_token
            .as_deref()
            .map(Address::from_str)
            .transpose()
            .context("invalid fee token")?;
        let key_authorization = self
            .key_authorization
            .as_deref()
            .map(decode_hex)
            .transpose()?
            .map(Into::into);

        Ok(UnsignedTransaction {
            chain_id: self.chain_id,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            max_fee_per_gas: self.max_fee_per_gas,
            gas_limit: self.gas_limit,
            calls,
            nonce_key,
            nonce: self.nonce,
            valid_before: self.valid_before,
            valid_after: self.valid_after,
            fee_mode: if self.self_pay {
                FeeMode::SelfPay
            } else {
                FeeMode::Sponsored
            },
            fee_token,
            key_authorization,
        })
    }
}

// ============================================================================
// Inspection
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CallSummary {
    pub to: String,
    pub value: String,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeyAuthorizationSummary {
    pub chain_id: u64,
    pub key_type: u64,
    pub key_id: String,
    pub expiry: u64,
    pub signature: Option<SignatureSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SignatureSummary {
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TxInspection {
    pub chain_id: u64,
    pub max_priority_fee_per_gas: String,
    pub max_fee_per_gas: String,
    pub gas_limit: u64,
    pub nonce_key: String,
    pub nonce: u64,
    pub valid_before: Option<u64>,
    pub valid_after: Option<u64>,
    pub sponsored: bool,
    pub calls: Vec<CallSummary>,
    pub key_authorization: Option<KeyAuthorizationSummary>,
    pub signature: Option<SignatureSummary>,
}

impl TxInspection {
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("chain id", self.chain_id.to_string()),
            ("max priority fee", self.max_priority_fee_per_gas.clone()),
            ("max fee", self.max_fee_per_gas.clone()),
            ("gas limit", self.gas_limit.to_string()),
            ("nonce key", self.nonce_key.clone()),
            ("nonce", self.nonce.to_string()),
            ("fee payer", if self.sponsored { "sponsor" } else { "sender" }.to_string()),
        ];
        for call in &self.calls {
            out.push(("call", format!("{} value={} input={}", call.to, call.value, call.input)));
        }
        if let Some(auth) = &self.key_authorization {
            out.push(("key id", auth.key_id.clone()));
            out.push(("key expiry", auth.expiry.to_string()));
        }
        if let Some(sig) = &self.signature {
            out.push(("signature", sig.scheme.clone()));
            if let Some(signer) = &sig.signer {
                out.push(("signer", signer.clone()));
            }
        }
        out
    }
}

pub fn describe_signature(sig: &SchemeSignature, length: usize) -> SignatureSummary {
    let (scheme, owner, signer) = match sig {
        SchemeSignature::Secp256k1(_) => ("secp256k1", None, None),
        SchemeSignature::P256(s) => ("p256", None, Some(format!("{:#x}", s.public_key.address()))),
        SchemeSignature::WebAuthn(s) => ("webauthn", None, Some(format!("{:#x}", s.public_key.address()))),
        SchemeSignature::Keychain { owner, inner } => {
            let inner = describe_signature(inner, length);
            return SignatureSummary {
                scheme: format!("keychain/{}", inner.scheme),
                owner: Some(format!("{owner:#x}")),
                signer: inner.signer,
                length,
            };
        }
    };
    SignatureSummary {
        scheme: scheme.to_string(),
        owner,
        signer,
        length,
    }
}

pub fn inspect_signature(bytes: &[u8]) -> anyhow::Result<SignatureSummary> {
    let sig = SchemeSignature::decode(bytes)?;
    Ok(describe_signature(&sig, bytes.len()))
}

fn quantity(item: &Item) -> anyhow::Result<String> {
    let bytes = item.as_bytes()?;
    if bytes.len() > 32 {
        bail!("quantity wider than 32 bytes");
    }
    Ok(U256::from_be_slice(bytes).to_string())
}

fn optional_u64(item: &Item) -> anyhow::Result<Option<u64>> {
    match item.as_bytes()? {
        [] => Ok(None),
        _ => Ok(Some(item.as_u64()?)),
    }
}

fn inspect_key_authorization(item: &Item) -> anyhow::Result<KeyAuthorizationSummary> {
    let parts = item.as_list()?;
    let tuple = parts
        .first()
        .ok_or_else(|| anyhow!("empty key authorization"))?
        .as_list()?;
    if tuple.len() != 4 {
        bail!("key authorization has {} fields, expected 4", tuple.len());
    }
    let signature = match parts.get(1) {
        Some(sig) => {
            let bytes = sig.as_bytes()?;
            Some(inspect_signature(bytes)?)
        }
        None => None,
    };
    Ok(KeyAuthorizationSummary {
        chain_id: tuple[0].as_u64()?,
        key_type: tuple[1].as_u64()?,
        key_id: format!("0x{}", hex::encode(tuple[2].as_bytes()?)),
        expiry: tuple[3].as_u64()?,
        signature,
    })
}

/// Decode a raw type `0x76` transaction, signed or unsigned.
pub fn inspect_transaction(raw: &[u8]) -> anyhow::Result<TxInspection> {
    match raw.first() {
        Some(&TX_TYPE) => {}
        Some(other) => bail!("unexpected transaction type 0x{other:02x}"),
        None => bail!("empty transaction"),
    }
    let item = decode(&raw[1..])?;
    let fields = item.as_list()?;
    if fields.len() < SIGNING_FIELD_COUNT || fields.len() > SIGNING_FIELD_COUNT + 2 {
        bail!("transaction has {} fields", fields.len());
    }

    let calls = fields[4]
        .as_list()?
        .iter()
        .map(|call| {
            let parts = call.as_list()?;
            if parts.len() != 3 {
                bail!("call has {} fields, expected 3", parts.len());
            }
            Ok(CallSummary {
                to: format!("0x{}", hex::encode(parts[0].as_bytes()?)),
                value: quantity(&parts[1])?,
                input: format!("0x{}", hex::encode(parts[2].as_bytes()?)),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let extra = &fields[SIGNING_FIELD_COUNT..];
    let (key_authorization, signature) = match extra {
        [] => (None, None),
        [single] => match single {
            Item::List(_) => (Some(inspect_key_authorization(single)?), None),
            _ => (None, Some(inspect_signature(single.as_bytes()?)?)),
        },
        [auth, sig, ..] => (
            Some(inspect_key_authorization(auth)?),
            Some(inspect_signature(sig.as_bytes()?)?),
        ),
    };

    Ok(TxInspection {
        chain_id: fields[0].as_u64()?,
        max_priority_fee_per_gas: quantity(&fields[1])?,
        max_fee_per_gas: quantity(&fields[2])?,
        gas_limit: fields[3].as_u64()?,
        nonce_key: format!("0x{}", hex::encode(fields[6].as_bytes()?)),
        nonce: fields[7].as_u64()?,
        valid_before: optional_u64(&fields[8])?,
        valid_after: optional_u64(&fields[9])?,
        sponsored: fields[11].as_bytes()? == &[0x00][..],
        calls,
        key_authorization,
        signature,
    })
}
