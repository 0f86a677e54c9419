//! vaultgate CLI: staged, human-gated document pipeline.
//!
//! Documents dropped into the intake area are chunked, reviewed, refined,
//! reviewed again and finally filed into a searchable vault.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
