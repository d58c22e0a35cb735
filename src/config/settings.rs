//! # Settings
//!
//! Process-level settings for the orchestrator: logging, background dispatch
//! and manager pooling. Chain configuration itself is compiled separately by
//! [`FilterManagerConfig`](crate::filtermanager::FilterManagerConfig).

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct ManagerSettings {
    #[validate(nested)]
    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[validate(nested)]
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[validate(nested)]
    #[serde(default)]
    pub pool: PoolConfig,

    /// Collect per-filter timings for every chain, not only chains that
    /// include the `debugMode` plugin.
    #[serde(default)]
    pub debug_mode: bool,
}

impl ManagerSettings {
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), or a full filter directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false }
    }
}

/// Background task runtime for phases that may block
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatchConfig {
    #[validate(range(min = 1, max = 256, message = "Worker threads must be between 1 and 256"))]
    pub worker_threads: usize,

    #[validate(range(
        min = 1,
        max = 4096,
        message = "Max blocking threads must be between 1 and 4096"
    ))]
    pub max_blocking_threads: usize,

    #[validate(length(min = 1, message = "Thread name cannot be empty"))]
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { worker_threads: 2, max_blocking_threads: 512, thread_name: "filterchain-bg".to_string() }
    }
}

/// Per-config pooling of stream state
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    /// Idle stream states kept per config (0 disables pooling)
    #[validate(range(max = 65536, message = "Max idle must be <= 65536"))]
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 1024 }
    }
}
