//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use pke_core::config::EngineConfig;
use pke_core::content_keys::{ContentKeyVault, MachineBoundWrapKey};
use pke_core::http_rpc::JsonRpcClient;
use pke_core::rpc::ChainRpc;
use pke_core::store::{JsonFileSessionStore, SessionKeyStore};
use pke_crypto::content::{EciesEnvelope, EnvelopeRecord};

use crate::output::{OutputFormat, OutputFormatter};
use crate::tx::{decode_hex, inspect_signature, inspect_transaction, TxSpec};
use crate::ExitCode;

/// PKE CLI - passkey session engine tooling
#[derive(Parser, Debug)]
#[command(name = "pke")]
#[command(version, about = "Passkey session engine tooling")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true, env = "PKE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Encode type 0x76 transactions
    #[command(subcommand)]
    Tx(TxCommand),
    /// Decode a raw transaction
    Inspect {
        /// Hex-encoded transaction
        raw: String,
    },
    /// Decode a scheme signature
    Signature {
        /// Hex-encoded signature
        raw: String,
    },
    /// Device content keypair and wrapped keys
    #[command(subcommand)]
    Content(ContentCommand),
    /// Show the saved session key for an owner
    Session {
        /// Owner account address
        owner: String,
    },
    /// Fetch a transaction receipt
    Receipt {
        /// Transaction hash
        tx_hash: String,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum TxCommand {
    /// Signing hash of an unsigned transaction
    Digest(TxArgs),
    /// Unsigned signing payload
    Encode(TxArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TxArgs {
    /// Chain id (defaults to the configured chain)
    #[arg(long)]
    pub chain_id: Option<u64>,
    #[arg(long, default_value_t = 0)]
    pub nonce: u64,
    /// Big-endian hex nonce key
    #[arg(long)]
    pub nonce_key: Option<String>,
    #[arg(long, default_value_t = 650_000)]
    pub gas: u64,
    #[arg(long)]
    pub max_fee: u128,
    #[arg(long)]
    pub priority_fee: u128,
    /// `to[,value[,0xinput]]`, repeatable
    #[arg(long = "call", required = true)]
    pub calls: Vec<String>,
    #[arg(long)]
    pub valid_before: Option<u64>,
    #[arg(long)]
    pub valid_after: Option<u64>,
    /// Sender pays its own fees
    #[arg(long)]
    pub self_pay: bool,
    #[arg(long)]
    pub fee_token: Option<String>,
    /// Hex-encoded key authorization payload
    #[arg(long)]
    pub key_authorization: Option<String>,
}

impl TxArgs {
    fn to_spec(&self, config: &EngineConfig) -> TxSpec {
        TxSpec {
            chain_id: self.chain_id.unwrap_or(config.chain_id),
            nonce: self.nonce,
            nonce_key: self.nonce_key.clone(),
            gas_limit: self.gas,
            max_fee_per_gas: self.max_fee,
            max_priority_fee_per_gas: self.priority_fee,
            calls: self.calls.clone(),
            valid_before: self.valid_before,
            valid_after: self.valid_after,
            self_pay: self.self_pay,
            fee_token: self.fee_token.clone().or_else(|| config.fee_token.clone()),
            key_authorization: self.key_authorization.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ContentCommand {
    /// Print (creating if needed) the device content public key
    Pubkey,
    /// Encrypt a file to a recipient public key
    Encrypt {
        /// Uncompressed P-256 public key, hex
        #[arg(long)]
        recipient: String,
        /// Plaintext file
        #[arg(long)]
        input: PathBuf,
        /// Store the envelope under this content id instead of printing it
        #[arg(long)]
        content_id: Option<String>,
    },
    /// Decrypt an envelope addressed to this device
    Decrypt {
        /// Envelope JSON file
        #[arg(long, conflicts_with = "content_id")]
        envelope: Option<PathBuf>,
        /// Stored wrapped key id
        #[arg(long)]
        content_id: Option<String>,
        /// Write plaintext here instead of printing hex
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove a stored wrapped key
    Forget {
        content_id: String,
    },
}

impl Cli {
    /// Load configuration: explicit file, else defaults and environment.
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let config = match &self.config {
            Some(path) => {
                let mut config = EngineConfig::load_from_file(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                config.load_from_env()?;
                config.validate()?;
                config
            }
            None => EngineConfig::load()?,
        };
        Ok(config)
    }

    pub async fn execute_with_config(self, config: EngineConfig) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output);
        let out = match self.command {
            Commands::Tx(cmd) => run_tx(&formatter, &config, cmd)?,
            Commands::Inspect { raw } => {
                let info = inspect_transaction(&decode_hex(&raw)?)?;
                formatter.render("inspect", &info.fields(), &info)
            }
            Commands::Signature { raw } => {
                let sig = inspect_signature(&decode_hex(&raw)?)?;
                let mut fields = vec![("scheme", sig.scheme.clone()), ("length", sig.length.to_string())];
                if let Some(owner) = &sig.owner {
                    fields.push(("owner", owner.clone()));
                }
                if let Some(signer) = &sig.signer {
                    fields.push(("signer", signer.clone()));
                }
                formatter.render("signature", &fields, &sig)
            }
            Commands::Content(cmd) => run_content(&formatter, &config, cmd).await?,
            Commands::Session { owner } => {
                let store = JsonFileSessionStore::new(config.sessions_dir());
                let Some(record) = store.load(&owner).await? else {
                    println!("{}", formatter.render_error("session", "no saved session key"));
                    return Ok(ExitCode::AuthenticationFailed);
                };
                let fields = vec![
                    ("session address", record.address.clone()),
                    ("owner", record.owner.clone()),
                    ("alias", record.alias.clone()),
                    ("expires at", record.expires_at.to_string()),
                    ("delegated", record.key_authorization.is_some().to_string()),
                ];
                formatter.render("session", &fields, &record)
            }
            Commands::Receipt { tx_hash } => {
                let client = JsonRpcClient::new(&config.rpc_url)?;
                debug!(url = %client.url(), tx_hash = %tx_hash, "fetching receipt");
                let Some(receipt) = client.get_transaction_receipt(&tx_hash).await? else {
                    println!("{}", formatter.render_error("receipt", "receipt not available"));
                    return Ok(ExitCode::Timeout);
                };
                let fields = vec![
                    ("transaction", receipt.transaction_hash.clone()),
                    ("status", receipt.status.clone()),
                    ("block", receipt.block_number.clone().unwrap_or_default()),
                    ("gas used", receipt.gas_used.clone().unwrap_or_default()),
                ];
                let out = formatter.render("receipt", &fields, &receipt);
                if !receipt.is_success() {
                    println!("{out}");
                    return Ok(ExitCode::GeneralError);
                }
                out
            }
            Commands::Config => {
                let rendered = toml::to_string_pretty(&config)?;
                match formatter.format() {
                    OutputFormat::Table => rendered,
                    _ => formatter.render("config", &[], &config),
                }
            }
        };
        if !out.is_empty() {
            println!("{out}");
        }
        Ok(ExitCode::Success)
    }
}

fn run_tx(formatter: &OutputFormatter, config: &EngineConfig, cmd: TxCommand) -> anyhow::Result<String> {
    let (name, args) = match &cmd {
        TxCommand::Digest(args) => ("tx digest", args),
        TxCommand::Encode(args) => ("tx encode", args),
    };
    let tx = args.to_spec(config).build()?;
    let digest = format!("0x{}", hex::encode(tx.signature_hash()));
    let payload = format!("0x{}", hex::encode(tx.signing_payload()));
    Ok(match cmd {
        TxCommand::Digest(_) => formatter.render(name, &[("digest", digest.clone())], &json!({ "digest": digest })),
        TxCommand::Encode(_) => formatter.render(
            name,
            &[("payload", payload.clone()), ("digest", digest.clone())],
            &json!({ "payload": payload, "digest": digest }),
        ),
    })
}

async fn run_content(formatter: &OutputFormatter, config: &EngineConfig, cmd: ContentCommand) -> anyhow::Result<String> {
    let vault = ContentKeyVault::new(config.content_dir(), Arc::new(MachineBoundWrapKey));
    match cmd {
        ContentCommand::Pubkey => {
            let public_key = format!("0x{}", hex::encode(vault.public_key().await?));
            Ok(formatter.render(
                "content pubkey",
                &[("public key", public_key.clone())],
                &json!({ "public_key": public_key }),
            ))
        }
        ContentCommand::Encrypt {
            recipient,
            input,
            content_id,
        } => {
            let plaintext = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let envelope = vault.encrypt_for_recipient(&decode_hex(&recipient)?, &plaintext)?;
            let record = envelope.to_record();
            if let Some(id) = content_id {
                vault.save_wrapped_key(&id, &envelope).await?;
                info!(content_id = %id, "stored wrapped key");
            }
            Ok(formatter.render(
                "content encrypt",
                &[
                    ("ephemeral key", record.ephemeral_pub.clone()),
                    ("iv", record.iv.clone()),
                    ("ciphertext", record.ciphertext.clone()),
                ],
                &record,
            ))
        }
        ContentCommand::Decrypt {
            envelope,
            content_id,
            out,
        } => {
            let envelope = match (envelope, content_id) {
                (Some(path), _) => {
                    let raw = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    let record: EnvelopeRecord = serde_json::from_slice(&raw)?;
                    EciesEnvelope::from_record(&record)?
                }
                (None, Some(id)) => match vault.load_wrapped_key(&id).await? {
                    Some(envelope) => envelope,
                    None => bail!("no wrapped key stored for {id}"),
                },
                (None, None) => bail!("either --envelope or --content-id is required"),
            };
            let plaintext = vault.decrypt_envelope(&envelope).await?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &plaintext)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    Ok(formatter.render(
                        "content decrypt",
                        &[("written", path.display().to_string()), ("bytes", plaintext.len().to_string())],
                        &json!({ "path": path, "bytes": plaintext.len() }),
                    ))
                }
                None => {
                    let hex_plaintext = format!("0x{}", hex::encode(&plaintext));
                    Ok(formatter.render(
                        "content decrypt",
                        &[("plaintext", hex_plaintext.clone())],
                        &json!({ "plaintext": hex_plaintext }),
                    ))
                }
            }
        }
        ContentCommand::Forget { content_id } => {
            let removed = vault.remove_wrapped_key(&content_id).await?;
            Ok(formatter.render(
                "content forget",
                &[("removed", removed.to_string())],
                &json!({ "content_id": content_id, "removed": removed }),
            ))
        }
    }
}
