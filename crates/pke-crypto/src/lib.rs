//! PKE Crypto - primitives shared by the passkey session engine.
//!
//! This crate implements:
//! - Canonical list/byte-string codec used by the transaction format
//! - DER signature parsing and P-256 low-S canonicalization
//! - Scheme-tagged signature encodings (P-256, WebAuthn, keychain, secp256k1)
//! - Hashing and P-256 address derivation
//! - Content cipher (ECIES over P-256 and AES-256-GCM)

#![forbid(unsafe_code)]

pub mod hash;
pub mod rlp;
pub mod der;
pub mod signature;

pub mod content;
pub mod utils;

#[cfg(test)]
mod proptests;
