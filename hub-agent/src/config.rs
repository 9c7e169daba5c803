//! Engine configuration loading
//!
//! Precedence, lowest first: built-in defaults, the `--config` JSON file,
//! `DEBUGHUB_*` environment variables, command-line flags.

use crate::Args;
use anyhow::Context;
use intercept_core::EngineConfig;
use std::path::Path;
use std::str::FromStr;

pub const ENV_STALENESS_MS: &str = "DEBUGHUB_STALENESS_MS";
pub const ENV_REFRESH_INTERVAL_MS: &str = "DEBUGHUB_REFRESH_INTERVAL_MS";
pub const ENV_BREAKPOINT_TIMEOUT_MS: &str = "DEBUGHUB_BREAKPOINT_TIMEOUT_MS";
pub const ENV_MAX_PENDING_BREAKPOINTS: &str = "DEBUGHUB_MAX_PENDING_BREAKPOINTS";
pub const ENV_RECORDER_CAPACITY: &str = "DEBUGHUB_RECORDER_CAPACITY";
pub const ENV_CHAOS_ENABLED: &str = "DEBUGHUB_CHAOS_ENABLED";
pub const ENV_CHAOS_SEED: &str = "DEBUGHUB_CHAOS_SEED";
pub const ENV_ADMIN_ADDR: &str = "DEBUGHUB_ADMIN_ADDR";
pub const ENV_ADMIN_PORT: &str = "DEBUGHUB_ADMIN_PORT";

/// Load the engine configuration using the process environment
pub fn load_engine_config(args: &Args) -> anyhow::Result<EngineConfig> {
    load_engine_config_with(args, |key| std::env::var(key).ok())
}

/// Load the engine configuration with an explicit environment lookup
pub fn load_engine_config_with<F>(args: &Args, env: F) -> anyhow::Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => read_config_file(path)?,
        None => EngineConfig::default(),
    };

    apply_env(&mut config, &env)?;
    apply_args(&mut config, args);

    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> anyhow::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

fn env_value<T, F>(env: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        _ => Ok(None),
    }
}

fn apply_env<F>(config: &mut EngineConfig, env: &F) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(ms) = env_value(env, ENV_STALENESS_MS)? {
        config.rule_store.staleness_ms = ms;
    }
    if let Some(ms) = env_value(env, ENV_REFRESH_INTERVAL_MS)? {
        config.rule_store.refresh_interval_ms = ms;
    }
    if let Some(ms) = env_value(env, ENV_BREAKPOINT_TIMEOUT_MS)? {
        config.breakpoint.default_timeout_ms = ms;
    }
    if let Some(max) = env_value(env, ENV_MAX_PENDING_BREAKPOINTS)? {
        config.breakpoint.max_pending = max;
    }
    if let Some(capacity) = env_value(env, ENV_RECORDER_CAPACITY)? {
        config.recorder.queue_capacity = capacity;
    }
    if let Some(enabled) = env_value(env, ENV_CHAOS_ENABLED)? {
        config.chaos.enabled = enabled;
    }
    if let Some(seed) = env_value(env, ENV_CHAOS_SEED)? {
        config.chaos.seed = Some(seed);
    }
    if let Some(addr) = env_value::<String, _>(env, ENV_ADMIN_ADDR)? {
        config.admin.listen_address = addr;
    }
    if let Some(port) = env_value(env, ENV_ADMIN_PORT)? {
        config.admin.port = port;
    }
    Ok(())
}

fn apply_args(config: &mut EngineConfig, args: &Args) {
    if let Some(ms) = args.staleness_ms {
        config.rule_store.staleness_ms = ms;
    }
    if let Some(ms) = args.breakpoint_timeout_ms {
        config.breakpoint.default_timeout_ms = ms;
    }
    if let Some(seed) = args.chaos_seed {
        config.chaos.seed = Some(seed);
    }
    if args.disable_chaos {
        config.chaos.enabled = false;
    }
    if let Some(addr) = &args.admin_addr {
        config.admin.listen_address = addr.clone();
    }
    if let Some(port) = args.admin_port {
        config.admin.port = port;
    }
}
