//! PKE Core - passkey-rooted session signing and transaction submission.
//!
//! This crate implements:
//! - The type `0x76` transaction encoder
//! - Root passkey signing with tagged authenticator outcomes
//! - Session key lifecycle over a secure key store
//! - The session authorization flow with relay fee retry and receipt polling
//! - Device content keypair and wrapped content keys
//! - Persistent storage abstraction

#![forbid(unsafe_code)]

// Core flows
pub mod authorize;
pub mod session_key;
pub mod passkey;

// Encoding and fees
pub mod transaction;
pub mod fees;

// Infrastructure
pub mod keystore;
pub mod store;
pub mod rpc;
pub mod content_keys;
pub mod config;

// Supporting modules
pub mod errors;
pub mod harness;

#[cfg(test)]
mod proptests;

// Optional RPC transport
#[cfg(feature = "http-rpc")]
pub mod http_rpc;
