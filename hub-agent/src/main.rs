//! DebugHub Agent Binary Entry Point

use clap::Parser;
use hub_agent::{init_logging, run_agent, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args.logging_config())?;

    if let Err(e) = run_agent(args).await {
        tracing::error!("Agent failed: {:#}", e);
        return Err(e);
    }

    Ok(())
}
