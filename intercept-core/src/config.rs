//! Configuration types and utilities

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Engine configuration
/// Every section falls back to its defaults when omitted from a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub rule_store: RuleStoreConfig,
    pub breakpoint: BreakpointConfig,
    pub recorder: RecorderConfig,
    pub chaos: ChaosConfig,
    pub admin: AdminConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.recorder.queue_capacity == 0 {
            return Err(EngineError::Configuration(
                "recorder.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.breakpoint.max_pending == 0 {
            return Err(EngineError::Configuration(
                "breakpoint.max_pending must be greater than zero".to_string(),
            ));
        }
        if self.rule_store.refresh_interval_ms == 0 {
            return Err(EngineError::Configuration(
                "rule_store.refresh_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.admin.socket_addr()?;
        Ok(())
    }
}

/// Rule snapshot freshness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleStoreConfig {
    /// A cached snapshot older than this is refetched on the next lookup
    pub staleness_ms: u64,
    /// Background refresher period
    pub refresh_interval_ms: u64,
}

impl Default for RuleStoreConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 2_000,
            refresh_interval_ms: 1_000,
        }
    }
}

impl RuleStoreConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointConfig {
    /// Auto-resume deadline for rules without their own timeout
    pub default_timeout_ms: u64,
    /// Units held at once; further matches pass through unpaused
    pub max_pending: usize,
}

impl Default for BreakpointConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_pending: 256,
        }
    }
}

impl BreakpointConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Events buffered ahead of the sink; the oldest is dropped when full
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    /// Global switch; when false chaos rules are matched but never injected
    pub enabled: bool,
    /// Fixed seed for reproducible runs; thread RNG otherwise
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed: None,
        }
    }
}

/// Operator/admin HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_address: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 9091,
        }
    }
}

impl AdminConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, EngineError> {
        format!("{}:{}", self.listen_address, self.port)
            .parse()
            .map_err(|e| {
                EngineError::Configuration(format!(
                    "Invalid admin address {}:{}: {}",
                    self.listen_address, self.port, e
                ))
            })
    }
}
