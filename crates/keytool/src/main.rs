//! `keytool`: key-management binary entry point.
//!
//! Startup sequence:
//! 1. Parse the command line.
//! 2. Load [`fields::FieldsConfig`] from `--config` or the environment.
//! 3. Initialise structured JSON logging on stderr.
//! 4. Run the subcommand against the configured keyset store.

mod cli;
mod commands;
mod config;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use fields::KeysetManager;
use tracing::info;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = config::load(cli.config.as_deref()).map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: keytool configuration invalid: {e:#}");
        e
    })?;
    if commands::needs_store(&cli.command) {
        config::validate_for_store(&cfg)?;
    }

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), command = ?cli.command, "keytool starting");

    // -----------------------------------------------------------------------
    // 3. Command
    // -----------------------------------------------------------------------
    let manager = KeysetManager::new(cfg);
    let stdout = std::io::stdout();
    commands::execute(&cli.command, &manager, &mut stdout.lock())
}
