// idtable-admin entrypoint
//!
//! Loads configuration, initializes logging, opens the store, then runs one
//! maintenance command. Ctrl-C cancels the command between store calls.

use anyhow::Result;
use clap::Parser;
use idtable_admin::args::Cli;
use idtable_admin::{commands, lifecycle, logging};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match lifecycle::load_config(&cli.config, cli.data_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Failed to load {}: {:#}", cli.config.display(), e);
            std::process::exit(1);
        }
    };

    // Logging before any other side effects
    let level_override = cli.verbose.then_some("debug");
    logging::init_logging(&config.logging, level_override)?;
    info!(
        "idtable-admin v{} ({:?} backend, data path {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.backend,
        config.storage.data_path
    );

    let ctx = lifecycle::bootstrap(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let output = commands::execute(&ctx, &cli.command, &cancel).await?;
    print!("{}", output);
    Ok(())
}
