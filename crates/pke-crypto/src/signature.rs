//! Scheme-tagged signature encodings.
//!
//! | scheme     | layout                                                    |
//! |------------|-----------------------------------------------------------|
//! | secp256k1  | `r(32) ‖ s(32) ‖ parity(1)` (no type byte)                |
//! | `0x01`     | `0x01 ‖ r ‖ s ‖ x ‖ y ‖ pre_hash(1)`                      |
//! | `0x02`     | `0x02 ‖ webauthn_data ‖ r ‖ s ‖ x ‖ y`                    |
//! | `0x03`     | `0x03 ‖ owner(20) ‖ inner`                                |

use alloy_primitives::Address;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use thiserror::Error;

use crate::hash::derive_p256_address;

pub const P256_SIGNATURE_TYPE: u8 = 0x01;
pub const WEBAUTHN_SIGNATURE_TYPE: u8 = 0x02;
pub const KEYCHAIN_SIGNATURE_TYPE: u8 = 0x03;

pub const SECP256K1_SIGNATURE_LEN: usize = 65;
/// r ‖ s ‖ x ‖ y ‖ pre_hash
pub const P256_SIGNATURE_LEN: usize = 129;
/// r ‖ s ‖ x ‖ y trailing a WebAuthn signature
const WEBAUTHN_TAIL_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("invalid signature length {0}")]
    InvalidLength(usize),
    #[error("unknown signature type {0:#04x}")]
    UnknownType(u8),
    #[error("invalid recovery value {0}")]
    InvalidParity(u64),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("nested keychain signature")]
    NestedKeychain,
}

/// Affine P-256 public key coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct P256PublicKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl P256PublicKey {
    pub fn new(x: [u8; 32], y: [u8; 32]) -> Self {
        Self { x, y }
    }

    /// Parse a SEC1 point (compressed or uncompressed) and check it is on the curve.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, SignatureError> {
        let key =
            p256::PublicKey::from_sec1_bytes(bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self::from(&key))
    }

    pub fn to_sec1_uncompressed(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x);
        out[33..].copy_from_slice(&self.y);
        out
    }

    pub fn to_verifying_key(&self) -> Result<p256::ecdsa::VerifyingKey, SignatureError> {
        p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.to_sec1_uncompressed())
            .map_err(|_| SignatureError::InvalidPublicKey)
    }

    pub fn address(&self) -> Address {
        derive_p256_address(&self.x, &self.y)
    }
}

impl From<&p256::PublicKey> for P256PublicKey {
    fn from(key: &p256::PublicKey) -> Self {
        let point = key.to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        // Uncompressed encodings of non-identity points always carry both coordinates.
        if let (Some(px), Some(py)) = (point.x(), point.y()) {
            x.copy_from_slice(px);
            y.copy_from_slice(py);
        }
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P256Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub public_key: P256PublicKey,
    pub pre_hash: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAuthnSignature {
    /// authenticator data ‖ client data JSON
    pub webauthn_data: Vec<u8>,
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub public_key: P256PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secp256k1Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Always 0 or 1.
    pub parity: u8,
}

impl Secp256k1Signature {
    /// Accepts `v` as 0/1, 27/28, or an EIP-155 value and keeps only the parity.
    pub fn new(r: [u8; 32], s: [u8; 32], v: u64) -> Result<Self, SignatureError> {
        Ok(Self {
            r,
            s,
            parity: normalize_parity(v)?,
        })
    }
}

pub fn normalize_parity(v: u64) -> Result<u8, SignatureError> {
    match v {
        0 | 1 => Ok(v as u8),
        27 | 28 => Ok((v - 27) as u8),
        v if v >= 35 => Ok(((v - 35) % 2) as u8),
        other => Err(SignatureError::InvalidParity(other)),
    }
}

/// A signature blob as it appears in the final transaction field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemeSignature {
    Secp256k1(Secp256k1Signature),
    P256(P256Signature),
    WebAuthn(WebAuthnSignature),
    Keychain {
        owner: Address,
        inner: Box<SchemeSignature>,
    },
}

impl SchemeSignature {
    /// Type byte, `None` for secp256k1.
    pub fn type_byte(&self) -> Option<u8> {
        match self {
            SchemeSignature::Secp256k1(_) => None,
            SchemeSignature::P256(_) => Some(P256_SIGNATURE_TYPE),
            SchemeSignature::WebAuthn(_) => Some(WEBAUTHN_SIGNATURE_TYPE),
            SchemeSignature::Keychain { .. } => Some(KEYCHAIN_SIGNATURE_TYPE),
        }
    }

    pub fn keychain(owner: Address, inner: SchemeSignature) -> Self {
        SchemeSignature::Keychain {
            owner,
            inner: Box::new(inner),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            SchemeSignature::Secp256k1(sig) => {
                let mut out = Vec::with_capacity(SECP256K1_SIGNATURE_LEN);
                out.extend_from_slice(&sig.r);
                out.extend_from_slice(&sig.s);
                out.push(sig.parity);
                out
            }
            SchemeSignature::P256(sig) => {
                let mut out = Vec::with_capacity(1 + P256_SIGNATURE_LEN);
                out.push(P256_SIGNATURE_TYPE);
                out.extend_from_slice(&sig.r);
                out.extend_from_slice(&sig.s);
                out.extend_from_slice(&sig.public_key.x);
                out.extend_from_slice(&sig.public_key.y);
                out.push(u8::from(sig.pre_hash));
                out
            }
            SchemeSignature::WebAuthn(sig) => {
                let mut out = Vec::with_capacity(1 + sig.webauthn_data.len() + WEBAUTHN_TAIL_LEN);
                out.push(WEBAUTHN_SIGNATURE_TYPE);
                out.extend_from_slice(&sig.webauthn_data);
                out.extend_from_slice(&sig.r);
                out.extend_from_slice(&sig.s);
                out.extend_from_slice(&sig.public_key.x);
                out.extend_from_slice(&sig.public_key.y);
                out
            }
            SchemeSignature::Keychain { owner, inner } => {
                let inner = inner.encode();
                let mut out = Vec::with_capacity(21 + inner.len());
                out.push(KEYCHAIN_SIGNATURE_TYPE);
                out.extend_from_slice(owner.as_slice());
                out.extend_from_slice(&inner);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SignatureError> {
        Self::decode_inner(bytes, true)
    }

    fn decode_inner(bytes: &[u8], allow_keychain: bool) -> Result<Self, SignatureError> {
        if bytes.len() == SECP256K1_SIGNATURE_LEN {
            return Ok(SchemeSignature::Secp256k1(Secp256k1Signature {
                r: fixed(&bytes[..32]),
                s: fixed(&bytes[32..64]),
                parity: normalize_parity(u64::from(bytes[64]))?,
            }));
        }

        let (&tag, body) = bytes
            .split_first()
            .ok_or(SignatureError::InvalidLength(0))?;
        match tag {
            P256_SIGNATURE_TYPE => {
                if body.len() != P256_SIGNATURE_LEN {
                    return Err(SignatureError::InvalidLength(bytes.len()));
                }
                Ok(SchemeSignature::P256(P256Signature {
                    r: fixed(&body[..32]),
                    s: fixed(&body[32..64]),
                    public_key: P256PublicKey::new(fixed(&body[64..96]), fixed(&body[96..128])),
                    pre_hash: body[128] != 0,
                }))
            }
            WEBAUTHN_SIGNATURE_TYPE => {
                if body.len() <= WEBAUTHN_TAIL_LEN {
                    return Err(SignatureError::InvalidLength(bytes.len()));
                }
                let split = body.len() - WEBAUTHN_TAIL_LEN;
                let tail = &body[split..];
                Ok(SchemeSignature::WebAuthn(WebAuthnSignature {
                    webauthn_data: body[..split].to_vec(),
                    r: fixed(&tail[..32]),
                    s: fixed(&tail[32..64]),
                    public_key: P256PublicKey::new(fixed(&tail[64..96]), fixed(&tail[96..128])),
                }))
            }
            KEYCHAIN_SIGNATURE_TYPE => {
                if !allow_keychain {
                    return Err(SignatureError::NestedKeychain);
                }
                if body.len() <= 20 {
                    return Err(SignatureError::InvalidLength(bytes.len()));
                }
                let owner = Address::from_slice(&body[..20]);
                let inner = Self::decode_inner(&body[20..], false)?;
                Ok(SchemeSignature::keychain(owner, inner))
            }
            other => Err(SignatureError::UnknownType(other)),
        }
    }
}

fn fixed(b: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(b);
    out
}
