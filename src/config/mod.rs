//! # Configuration Management
//!
//! Settings are read from `FILTERCHAIN_*` environment variables on top of
//! the defaults, then validated.

pub mod settings;

pub use settings::{DispatchConfig, ManagerSettings, ObservabilityConfig, PoolConfig};

use crate::errors::{Error, Result};

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

impl ManagerSettings {
    /// Create settings from environment variables
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(level) = std::env::var("FILTERCHAIN_LOG_LEVEL") {
            settings.observability.log_level = level;
        }
        if let Some(json) = env_parse("FILTERCHAIN_JSON_LOGGING")? {
            settings.observability.json_logging = json;
        }
        if let Some(threads) = env_parse("FILTERCHAIN_WORKER_THREADS")? {
            settings.dispatch.worker_threads = threads;
        }
        if let Some(threads) = env_parse("FILTERCHAIN_MAX_BLOCKING_THREADS")? {
            settings.dispatch.max_blocking_threads = threads;
        }
        if let Some(max_idle) = env_parse("FILTERCHAIN_POOL_MAX_IDLE")? {
            settings.pool.max_idle = max_idle;
        }
        if let Some(debug) = env_parse("FILTERCHAIN_DEBUG_MODE")? {
            settings.debug_mode = debug;
        }

        settings.validate()?;
        Ok(settings)
    }
}
