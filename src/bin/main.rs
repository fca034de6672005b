//! llamactx binary.
//!
//! Loads GGUF models through the context pool and runs completions,
//! queued requests, tokenizer and embedding checks from the command line.

use clap::Parser;
use llamactx_core::{
    cli::{init_logging, run, Cli},
    config::Settings,
    LlamaService,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;
    let _log_guard = init_logging(&settings.logging)?;

    info!("llamactx starting up");
    let service = LlamaService::from_settings(&settings);

    let outcome = tokio::select! {
        outcome = run(&service, cli.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, releasing contexts");
            Ok(())
        }
    };

    service.release_all_contexts().await?;
    outcome
}
