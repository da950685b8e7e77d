// src/main.rs

use std::process::ExitCode;

use clap::Parser;
use mes_core::cli::{self, Cli};
use mes_core::config::AppConfig;
use mes_core::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load environment from .env if present
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = telemetry::init(&config.telemetry) {
        eprintln!("configuration error: {err}");
        return ExitCode::from(1);
    }

    match cli::run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(err.exit_code())
        }
    }
}
