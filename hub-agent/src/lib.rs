//! DebugHub Agent
//!
//! Standalone harness around the interception engine. Rules come from a JSON
//! file, traffic is replayed from a JSONL capture and finalized events are
//! appended to a JSONL file. The operator API stays up so suspended units can
//! be resumed, edited or cancelled while the replay runs.

use clap::Parser;
use intercept_core::{start_admin_server, InterceptEngine};
use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod files;
pub mod logging;
pub mod replay;


pub use config::{load_engine_config, load_engine_config_with};
pub use files::{FileRuleSource, JsonlEventSink};
pub use logging::{init_logging, LoggingConfig};
pub use replay::{replay_file, replay_lines, ReplayRecord, ReplaySummary};

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON file with the rule table (array of rule records)
    #[arg(long)]
    pub rules: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Captured traffic to replay, one JSON record per line
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Where recorded events are appended
    #[arg(long, default_value = "events.jsonl")]
    pub events_out: PathBuf,

    /// Address the admin API binds to
    #[arg(long)]
    pub admin_addr: Option<String>,

    /// Port of the admin API
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Auto-resume deadline for breakpoints without their own timeout
    #[arg(long)]
    pub breakpoint_timeout_ms: Option<u64>,

    /// Age after which a cached rule snapshot is refetched
    #[arg(long)]
    pub staleness_ms: Option<u64>,

    /// Seed for reproducible chaos runs
    #[arg(long)]
    pub chaos_seed: Option<u64>,

    /// Match chaos rules but never inject faults
    #[arg(long)]
    pub disable_chaos: bool,

    /// Exit once the replay has finished instead of serving the admin API
    #[arg(long)]
    pub once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Write logs to this file (daily rotation) instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            log_file: self.log_file.clone(),
            ..Default::default()
        }
    }
}

pub async fn run_agent(args: Args) -> anyhow::Result<()> {
    let config = load_engine_config(&args)?;
    let admin_addr = config.admin.socket_addr()?;

    tracing::info!("Starting DebugHub agent...");
    tracing::info!("  Rules:  {}", args.rules.display());
    tracing::info!("  Events: {}", args.events_out.display());
    tracing::info!("  Admin:  {}", admin_addr);

    let source = Arc::new(FileRuleSource::new(&args.rules));
    if let Some(seed) = config.chaos.seed {
        tracing::info!("  Chaos seed: {}", seed);
    }
    let engine = Arc::new(InterceptEngine::new(config, source)?);

    let sink = Arc::new(JsonlEventSink::create(&args.events_out).await?);
    let tasks = engine.start(sink);

    let mut admin = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(admin_addr, engine).await {
                tracing::error!("Admin API failed: {}", e);
            }
        })
    };

    if let Some(input) = &args.input {
        let summary = replay_file(&engine, input).await?;
        tracing::info!(
            units = summary.units,
            mocked = summary.mocked,
            suspended = summary.suspended,
            chaos = summary.chaos,
            skipped_lines = summary.skipped_lines,
            "Replay finished"
        );
    }

    if !args.once {
        tokio::select! {
            result = &mut admin => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping agent...");
            }
        }
    }
    admin.abort();

    engine.shutdown();
    tasks.refresher.abort();
    tasks.recorder.await?;
    let stats = engine.recorder_stats();
    tracing::info!(
        recorded = stats.recorded,
        dropped = stats.dropped,
        sink_failures = stats.sink_failures,
        "Agent stopped"
    );
    Ok(())
}
