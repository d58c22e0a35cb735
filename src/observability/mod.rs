//! # Observability
//!
//! Structured logging for the orchestrator. Filters and the manager log
//! through `tracing`; this module only installs the subscriber.

pub mod logging;

pub use logging::{init_logging, log_settings_info};

use crate::config::ManagerSettings;
use crate::errors::Result;

/// Initialize logging from settings and report the effective configuration.
pub fn init_observability(settings: &ManagerSettings) -> Result<()> {
    init_logging(&settings.observability)?;
    log_settings_info(settings);
    Ok(())
}
