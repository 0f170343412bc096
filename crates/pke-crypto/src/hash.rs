use alloy_primitives::Address;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    alloy_primitives::keccak256(data).0
}

/// Account address of a P-256 key: last 20 bytes of keccak256(x || y).
pub fn derive_p256_address(x: &[u8; 32], y: &[u8; 32]) -> Address {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(x);
    buf[32..].copy_from_slice(y);
    let hash = keccak256(&buf);
    Address::from_slice(&hash[12..])
}

/// Message an authenticator signs for an assertion:
/// sha256(authenticator_data || sha256(client_data_json)).
pub fn webauthn_message_hash(authenticator_data: &[u8], client_data_json: &[u8]) -> [u8; 32] {
    let client_hash = sha256(client_data_json);
    let mut h = Sha256::new();
    h.update(authenticator_data);
    h.update(client_hash);
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&h.finalize());
    arr
}
