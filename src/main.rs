//! Quill - Versioned Canvas Document Engine
//!
//! CLI entry point for the Quill server and tools.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod indexer;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill=info,quill_canvas=info,tower_http=info".into()),
        )
        .with(cli.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    let config = config::load_config()?;
    if cli.command.is_some() {
        info!("Starting Quill v{}", env!("CARGO_PKG_VERSION"));
    }

    cli::run(cli, config).await
}
