//! PKE CLI - offline tooling around the session engine
//!
//! This crate provides a command-line interface for:
//! - Encoding type `0x76` transactions and computing their signing hash
//! - Inspecting raw transactions and scheme signatures
//! - Managing the device content keypair and wrapped content keys
//! - Looking up receipts and saved session keys

pub mod cli;
pub mod output;
pub mod tx;

pub use cli::Cli;
pub use output::{JsonResponse, OutputFormat, OutputFormatter};

use pke_core::errors::{EngineError, ErrorClass};

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Authorization failed or session key unusable
/// - 3: Timeout
/// - 4: Connection failed
/// - 5: Invalid input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AuthenticationFailed = 2,
    Timeout = 3,
    ConnectionFailed = 4,
    InvalidInput = 5,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
        }
    }

    /// Exit code for an engine error.
    pub fn for_error(err: &EngineError) -> Self {
        match err {
            EngineError::ReceiptTimeout { .. } => ExitCode::Timeout,
            EngineError::Transient(_) => ExitCode::ConnectionFailed,
            EngineError::CryptoDecode(_) => ExitCode::InvalidInput,
            other => match other.class() {
                ErrorClass::Reauthorize => ExitCode::AuthenticationFailed,
                _ => ExitCode::GeneralError,
            },
        }
    }
}
