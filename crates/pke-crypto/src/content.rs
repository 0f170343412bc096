//! Content cipher: AES-256-GCM payload encryption and ECIES key wrapping.
//!
//! ECIES construction:
//! 1. ephemeral P-256 keypair
//! 2. ECDH with the recipient public key (raw x-coordinate)
//! 3. key = sha256(shared secret)
//! 4. AES-256-GCM with a random 12-byte IV
//!
//! The long-lived content secret key is sealed at rest as
//! `enc:v1:<iv hex>:<ciphertext hex>` under a wrap key; its scalar is never
//! handed out of this module.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::{diffie_hellman, EphemeralSecret};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::hash::sha256;

pub const AES_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const UNCOMPRESSED_POINT_LEN: usize = 65;

const SEALED_PREFIX: &str = "enc:v1:";
const WRAP_KEY_INFO: &[u8] = b"pke-content-keypair-wrap-v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("authentication failed: ciphertext or envelope was modified")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid hex in {0}")]
    Hex(&'static str),
    #[error("unrecognized sealed key format")]
    Format,
    #[error("random generator failure")]
    Rng,
}

pub type ContentKey = Zeroizing<[u8; AES_KEY_LEN]>;

fn random_bytes<const N: usize>() -> Result<[u8; N], ContentError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|_| ContentError::Rng)?;
    Ok(out)
}

fn aes_encrypt(key: &[u8; AES_KEY_LEN], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, ContentError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ContentError::Encryption)?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| ContentError::Encryption)
}

fn aes_decrypt(key: &[u8; AES_KEY_LEN], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, ContentError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ContentError::Encryption)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ContentError::Authentication)
}

// ============================================================================
// File payloads
// ============================================================================

/// Result of encrypting a content payload under a fresh key.
pub struct EncryptedBlob {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub raw_key: ContentKey,
}

impl EncryptedBlob {
    /// Single-buffer layout: `iv ‖ ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

pub fn encrypt_file(plaintext: &[u8]) -> Result<EncryptedBlob, ContentError> {
    let raw_key = Zeroizing::new(random_bytes::<AES_KEY_LEN>()?);
    let iv = random_bytes::<IV_LEN>()?;
    let ciphertext = aes_encrypt(&raw_key, &iv, plaintext)?;
    Ok(EncryptedBlob {
        iv,
        ciphertext,
        raw_key,
    })
}

pub fn decrypt_file(
    raw_key: &[u8; AES_KEY_LEN],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ContentError> {
    aes_decrypt(raw_key, iv, ciphertext)
}

/// Decrypt a single-buffer `iv ‖ ciphertext` payload.
pub fn decrypt_blob(raw_key: &[u8; AES_KEY_LEN], blob: &[u8]) -> Result<Vec<u8>, ContentError> {
    if blob.len() < IV_LEN + TAG_LEN {
        return Err(ContentError::InvalidLength {
            field: "blob",
            expected: IV_LEN + TAG_LEN,
            actual: blob.len(),
        });
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let mut iv_arr = [0u8; IV_LEN];
    iv_arr.copy_from_slice(iv);
    aes_decrypt(raw_key, &iv_arr, ciphertext)
}

// ============================================================================
// ECIES
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct EciesEnvelope {
    pub ephemeral_public_key: [u8; UNCOMPRESSED_POINT_LEN],
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for EciesEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EciesEnvelope")
            .field("ephemeral_public_key", &hex::encode(self.ephemeral_public_key))
            .field("iv", &hex::encode(self.iv))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Hex form of an envelope for JSON persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub ephemeral_pub: String,
    pub iv: String,
    pub ciphertext: String,
}

impl EciesEnvelope {
    pub fn to_record(&self) -> EnvelopeRecord {
        EnvelopeRecord {
            ephemeral_pub: hex::encode(self.ephemeral_public_key),
            iv: hex::encode(self.iv),
            ciphertext: hex::encode(&self.ciphertext),
        }
    }

    pub fn from_record(record: &EnvelopeRecord) -> Result<Self, ContentError> {
        let ephemeral = decode_hex("ephemeral_pub", &record.ephemeral_pub)?;
        let iv = decode_hex("iv", &record.iv)?;
        let ciphertext = decode_hex("ciphertext", &record.ciphertext)?;
        Ok(Self {
            ephemeral_public_key: to_array("ephemeral_pub", &ephemeral)?,
            iv: to_array("iv", &iv)?,
            ciphertext,
        })
    }
}

fn decode_hex(field: &'static str, s: &str) -> Result<Vec<u8>, ContentError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|_| ContentError::Hex(field))
}

fn to_array<const N: usize>(field: &'static str, b: &[u8]) -> Result<[u8; N], ContentError> {
    b.try_into().map_err(|_| ContentError::InvalidLength {
        field,
        expected: N,
        actual: b.len(),
    })
}

fn derive_ecies_key(shared_x: &[u8]) -> ContentKey {
    Zeroizing::new(sha256(shared_x))
}

fn uncompressed(public: &PublicKey) -> Result<[u8; UNCOMPRESSED_POINT_LEN], ContentError> {
    let point = public.to_encoded_point(false);
    to_array("public key", point.as_bytes())
}

/// Wrap `plaintext` to `recipient_public_key` (SEC1, compressed or uncompressed).
pub fn ecies_encrypt(recipient_public_key: &[u8], plaintext: &[u8]) -> Result<EciesEnvelope, ContentError> {
    let recipient =
        PublicKey::from_sec1_bytes(recipient_public_key).map_err(|_| ContentError::InvalidPublicKey)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public_key = uncompressed(&ephemeral.public_key())?;
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_ecies_key(shared.raw_secret_bytes().as_slice());

    let iv = random_bytes::<IV_LEN>()?;
    let ciphertext = aes_encrypt(&key, &iv, plaintext)?;
    Ok(EciesEnvelope {
        ephemeral_public_key,
        iv,
        ciphertext,
    })
}

pub fn ecies_decrypt(secret: &ContentSecretKey, envelope: &EciesEnvelope) -> Result<Vec<u8>, ContentError> {
    // A flipped point byte either leaves the curve or yields a different
    // shared key; both surface as an authentication failure.
    let ephemeral = PublicKey::from_sec1_bytes(&envelope.ephemeral_public_key)
        .map_err(|_| ContentError::Authentication)?;
    let shared = diffie_hellman(secret.0.to_nonzero_scalar(), ephemeral.as_affine());
    let key = derive_ecies_key(shared.raw_secret_bytes().as_slice());
    aes_decrypt(&key, &envelope.iv, &envelope.ciphertext)
}

// ============================================================================
// Content keypair
// ============================================================================

/// Long-lived P-256 secret for content key unwrapping. Zeroized on drop.
pub struct ContentSecretKey(SecretKey);

impl std::fmt::Debug for ContentSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentSecretKey(<redacted>)")
    }
}

/// Derive the at-rest wrap key from device-bound material.
pub fn derive_wrap_key(material: &[u8], salt: &[u8]) -> Result<ContentKey, ContentError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), material);
    let mut key = Zeroizing::new([0u8; AES_KEY_LEN]);
    hk.expand(WRAP_KEY_INFO, &mut key[..])
        .map_err(|_| ContentError::Encryption)?;
    Ok(key)
}

pub fn is_sealed(stored: &str) -> bool {
    stored.trim().starts_with(SEALED_PREFIX)
}

impl ContentSecretKey {
    pub fn generate() -> Self {
        Self(SecretKey::random(&mut OsRng))
    }

    pub fn public_key_bytes(&self) -> [u8; UNCOMPRESSED_POINT_LEN] {
        let point = self.0.public_key().to_encoded_point(false);
        let mut out = [0u8; UNCOMPRESSED_POINT_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Parse the legacy plaintext storage format: the scalar as hex.
    pub fn from_legacy_hex(stored: &str) -> Result<Self, ContentError> {
        let bytes = Zeroizing::new(decode_hex("private key", stored.trim())?);
        SecretKey::from_slice(bytes.as_slice())
            .map(Self)
            .map_err(|_| ContentError::InvalidSecretKey)
    }

    pub fn seal(&self, wrap_key: &[u8; AES_KEY_LEN]) -> Result<String, ContentError> {
        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar.copy_from_slice(&self.0.to_bytes());
        let iv = random_bytes::<IV_LEN>()?;
        let ciphertext = aes_encrypt(wrap_key, &iv, scalar.as_slice())?;
        Ok(format!(
            "{}{}:{}",
            SEALED_PREFIX,
            hex::encode(iv),
            hex::encode(ciphertext)
        ))
    }

    pub fn unseal(wrap_key: &[u8; AES_KEY_LEN], stored: &str) -> Result<Self, ContentError> {
        let body = stored
            .trim()
            .strip_prefix(SEALED_PREFIX)
            .ok_or(ContentError::Format)?;
        let (iv_hex, ct_hex) = body.split_once(':').ok_or(ContentError::Format)?;
        let iv: [u8; IV_LEN] = to_array("iv", &decode_hex("iv", iv_hex)?)?;
        let ciphertext = decode_hex("ciphertext", ct_hex)?;
        let scalar = Zeroizing::new(aes_decrypt(wrap_key, &iv, &ciphertext)?);
        SecretKey::from_slice(scalar.as_slice())
            .map(Self)
            .map_err(|_| ContentError::InvalidSecretKey)
    }
}

/// Content keypair: sealed secret plus its published public half.
#[derive(Debug)]
pub struct ContentKeyPair {
    pub secret: ContentSecretKey,
    pub public_key: [u8; UNCOMPRESSED_POINT_LEN],
}

impl ContentKeyPair {
    pub fn generate() -> Self {
        let secret = ContentSecretKey::generate();
        let public_key = secret.public_key_bytes();
        Self { secret, public_key }
    }

    pub fn from_secret(secret: ContentSecretKey) -> Self {
        let public_key = secret.public_key_bytes();
        Self { secret, public_key }
    }
}
