//! PKE CLI entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pke_cli::{Cli, ExitCode, OutputFormatter};
use pke_core::config::EngineConfig;
use pke_core::errors::EngineError;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Config error: {e:#}");
            eprintln!("Using default configuration.");
            EngineConfig::default()
        }
    };

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let formatter = OutputFormatter::new(cli.output);
    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            let code = match e.downcast_ref::<EngineError>() {
                Some(engine) => ExitCode::for_error(engine),
                None => ExitCode::GeneralError,
            };
            tracing::debug!(exit_code = code.name(), "command failed");
            eprintln!("{}", formatter.render_error("pke", &format!("{}: {e:#}", code.name())));
            code.to_exit_code()
        }
    }
}
