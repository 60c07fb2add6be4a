mod cli;
mod commands;

use clap::Parser;
use ocrd_client::view::render_error_banner;
use ocrd_client::{AnalysisClient, ClientLogger, LogLevel};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let level = match args.log_level.parse::<LogLevel>() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{}", render_error_banner("Invalid log level", &err));
            return ExitCode::FAILURE;
        }
    };
    let mut logger = ClientLogger::new(level);
    if let Some(path) = args.log_file.as_deref() {
        logger = logger.with_persistence(path);
    }
    let client = match AnalysisClient::new(&args.gateway, Arc::new(logger)) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("{}", render_error_banner("Client setup failed", err.message()));
            return ExitCode::FAILURE;
        }
    };

    match commands::execute(client, args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let context = err.to_string();
            let cause = err
                .chain()
                .skip(1)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(": ");
            if cause.is_empty() {
                eprintln!("{}", render_error_banner("", &context));
            } else {
                eprintln!("{}", render_error_banner(&context, &cause));
            }
            ExitCode::FAILURE
        }
    }
}

/// Request logging reaches stderr only with `--verbose`; `RUST_LOG` overrides.
fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
