// src/main.rs

use bake::cli::{Cli, normalize_args};
use bake::commands;
use bake::signal::CancelToken;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_from(normalize_args(std::env::args()));

    // RUST_LOG wins; --verbose raises the default level
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelToken::new();
    if let Err(e) = cancel.register() {
        tracing::warn!("Signal handlers not installed: {}", e);
    }

    if let Err(e) = commands::dispatch(cli, cancel) {
        eprintln!("Error: {:#}", e);
        std::process::exit(commands::exit_code(&e));
    }
}
