//! Engine configuration.
//!
//! Sources, later ones winning: built-in defaults, a TOML file named by
//! `PKE_CONFIG`, then individual `PKE_*` environment variables.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fees::FeePolicy;
use crate::session_key::DEFAULT_SESSION_VALIDITY_SECS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub fee_payer_url: String,
    pub rp_id: String,
    pub data_dir: PathBuf,
    /// Self-pay fee token, hex address.
    pub fee_token: Option<String>,
    pub session_validity_secs: u64,
    pub receipt_timeout_ms: u64,
    pub receipt_poll_interval_ms: u64,
    pub max_underpriced_retries: u32,
    pub max_transient_retries: u32,
    pub transient_retry_delay_ms: u64,
    pub min_priority_fee_per_gas: u64,
    pub min_fee_bump_wei: u64,
    pub fee_bump_numerator: u64,
    pub fee_bump_denominator: u64,
    pub authorize_gas_limit_floor: u64,
    pub gas_limit_buffer: u64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain_id: 42431,
            rpc_url: "https://rpc.moderato.tempo.xyz".to_string(),
            fee_payer_url: "https://sponsor.moderato.tempo.xyz".to_string(),
            rp_id: "localhost".to_string(),
            data_dir: PathBuf::from(".pke"),
            fee_token: None,
            session_validity_secs: DEFAULT_SESSION_VALIDITY_SECS,
            receipt_timeout_ms: 45_000,
            receipt_poll_interval_ms: 1_250,
            max_underpriced_retries: 3,
            max_transient_retries: 2,
            transient_retry_delay_ms: 500,
            min_priority_fee_per_gas: 1_000_000,
            min_fee_bump_wei: 1_000_000,
            fee_bump_numerator: 12,
            fee_bump_denominator: 10,
            authorize_gas_limit_floor: 650_000,
            gas_limit_buffer: 250_000,
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(name: &str, raw: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    *target = raw
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{name}={raw:?}: {e}")))?;
    Ok(())
}

impl EngineConfig {
    /// Defaults, then `PKE_CONFIG` file, then environment; validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PKE_CONFIG") {
            Ok(path) => Self::load_from_file(path)?,
            Err(_) => Self::default(),
        };
        config.load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Missing keys take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_from_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        macro_rules! parsed {
            ($name:literal, $field:expr) => {
                if let Some(raw) = lookup($name) {
                    parse_var($name, &raw, &mut $field)?;
                }
            };
        }

        parsed!("PKE_CHAIN_ID", self.chain_id);
        parsed!("PKE_SESSION_VALIDITY_SECS", self.session_validity_secs);
        parsed!("PKE_RECEIPT_TIMEOUT_MS", self.receipt_timeout_ms);
        parsed!("PKE_RECEIPT_POLL_INTERVAL_MS", self.receipt_poll_interval_ms);
        parsed!("PKE_MAX_UNDERPRICED_RETRIES", self.max_underpriced_retries);
        parsed!("PKE_MAX_TRANSIENT_RETRIES", self.max_transient_retries);
        parsed!("PKE_MIN_PRIORITY_FEE_PER_GAS", self.min_priority_fee_per_gas);
        parsed!("PKE_MIN_FEE_BUMP_WEI", self.min_fee_bump_wei);
        parsed!("PKE_AUTHORIZE_GAS_LIMIT_FLOOR", self.authorize_gas_limit_floor);

        if let Some(v) = lookup("PKE_RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = lookup("PKE_FEE_PAYER_URL") {
            self.fee_payer_url = v;
        }
        if let Some(v) = lookup("PKE_RP_ID") {
            self.rp_id = v;
        }
        if let Some(v) = lookup("PKE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PKE_FEE_TOKEN") {
            self.fee_token = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = lookup("RUST_LOG").or_else(|| lookup("PKE_LOG_LEVEL")) {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id == 0 {
            return Err(ConfigError::Invalid("chain_id must be > 0".to_string()));
        }
        for (name, url) in [("rpc_url", &self.rpc_url), ("fee_payer_url", &self.fee_payer_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("{name} must be an http(s) URL: {url:?}")));
            }
        }
        if self.rp_id.trim().is_empty() {
            return Err(ConfigError::Invalid("rp_id must not be empty".to_string()));
        }
        if self.session_validity_secs == 0 {
            return Err(ConfigError::Invalid("session_validity_secs must be > 0".to_string()));
        }
        if self.receipt_poll_interval_ms == 0 || self.receipt_timeout_ms < self.receipt_poll_interval_ms {
            return Err(ConfigError::Invalid(
                "receipt_timeout_ms must be >= receipt_poll_interval_ms > 0".to_string(),
            ));
        }
        if self.fee_bump_denominator == 0 || self.fee_bump_numerator <= self.fee_bump_denominator {
            return Err(ConfigError::Invalid(
                "fee bump ratio must be greater than 1".to_string(),
            ));
        }
        if self.min_fee_bump_wei == 0 {
            return Err(ConfigError::Invalid("min_fee_bump_wei must be > 0".to_string()));
        }
        self.fee_token_address()?;
        Ok(())
    }

    pub fn fee_token_address(&self) -> Result<Option<Address>, ConfigError> {
        self.fee_token
            .as_deref()
            .map(|s| {
                s.trim()
                    .parse::<Address>()
                    .map_err(|e| ConfigError::Invalid(format!("fee_token {s:?}: {e}")))
            })
            .transpose()
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            bump_numerator: self.fee_bump_numerator as u128,
            bump_denominator: self.fee_bump_denominator as u128,
            min_priority_fee: self.min_priority_fee_per_gas as u128,
            min_bump: self.min_fee_bump_wei as u128,
        }
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transient_retry_delay_ms)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.receipt_timeout(), Duration::from_secs(45));
        assert_eq!(config.receipt_poll_interval(), Duration::from_millis(1250));
        assert_eq!(config.max_underpriced_retries, 3);
        assert_eq!(config.fee_policy(), FeePolicy::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pke.toml");
        std::fs::write(&path, "chain_id = 7\nrp_id = \"app.example\"\n").unwrap();

        let config = EngineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.chain_id, 7);
        assert_eq!(config.rp_id, "app.example");
        assert_eq!(config.receipt_timeout_ms, 45_000);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PKE_CHAIN_ID", "99"),
            ("PKE_RPC_URL", "http://127.0.0.1:8545"),
            ("PKE_MAX_UNDERPRICED_RETRIES", "5"),
            ("PKE_FEE_TOKEN", "0x20c0000000000000000000000000000000000001"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.chain_id, 99);
        assert_eq!(config.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(config.max_underpriced_retries, 5);
        assert!(config.fee_token_address().unwrap().is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|k| (k == "PKE_CHAIN_ID").then(|| "forty-two".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PKE_CHAIN_ID"));
    }

    #[test]
    fn test_validate_rejects() {
        let mut c = EngineConfig::default();
        c.fee_bump_numerator = 10;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.rpc_url = "ftp://node".into();
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.receipt_timeout_ms = 100;
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.fee_token = Some("0x1234".into());
        assert!(c.validate().is_err());
    }
}
