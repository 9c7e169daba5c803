use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable JSON formatted logs
    pub json_format: bool,

    /// Whether to include file and line number information
    pub include_file_info: bool,

    /// Whether to enable colored output (only for non-JSON stdout logs)
    pub enable_colors: bool,

    /// Log file path; logs go to stdout when unset
    pub log_file: Option<PathBuf>,

    /// Module-specific log levels
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = HashMap::new();
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("tokio".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_file_info: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

impl LoggingConfig {
    pub fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        if !levels::is_valid_level(&self.level) {
            anyhow::bail!(
                "Invalid log level '{}', expected one of {:?}",
                self.level,
                levels::VALID_LEVELS
            );
        }

        let mut filter = EnvFilter::new(&self.level);
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid log directive: {}", directive))?,
            );
        }
        Ok(filter)
    }
}

/// Initialize logging. The returned guard flushes the file writer on drop and
/// must be held for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;

    let (writer, guard) = match &config.log_file {
        Some(path) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(create_file_appender(path)?);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let base = fmt::layer()
        .with_target(true)
        .with_file(config.include_file_info)
        .with_line_number(config.include_file_info)
        .with_writer(writer);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        base.json().boxed()
    } else {
        base.with_ansi(config.enable_colors && config.log_file.is_none())
            .boxed()
    };

    // Try to initialize logging, ignore if already initialized
    match tracing_subscriber::registry().with(layer).with(filter).try_init() {
        Ok(_) => tracing::info!("Logging initialized with level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

/// Daily-rotated appender for `log_file`
fn create_file_appender(log_file: &Path) -> anyhow::Result<RollingFileAppender> {
    let directory = match log_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let filename = log_file
        .file_name()
        .context("Invalid log file name")?
        .to_string_lossy();

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    Ok(RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        filename.as_ref(),
    ))
}

/// Log level utilities
pub mod levels {
    pub const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        VALID_LEVELS.contains(&level.to_lowercase().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_filter() {
        let config = LoggingConfig::default();
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.env_filter().is_err());
    }

    #[test]
    fn test_valid_levels() {
        assert!(levels::is_valid_level("INFO"));
        assert!(levels::is_valid_level("trace"));
        assert!(!levels::is_valid_level("verbose"));
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("agent.log");
        create_file_appender(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
