#![warn(missing_docs)]

//! `bhctl`: Blobhouse data warehouse CLI

use anyhow::Result;
use blobhouse_engine::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "bhctl starting");
    cli.run().await
}
