//! # Structured Logging
//!
//! Subscriber setup and span macros built on the tracing ecosystem.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Create a tracing span for one proxied stream.
///
/// ```rust,ignore
/// let span = stream_span!(info.route_name);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! stream_span {
    ($route:expr) => {
        tracing::info_span!(
            "stream",
            route = %$route,
            stream_id = %uuid::Uuid::new_v4(),
            consumer = tracing::field::Empty
        )
    };
    ($route:expr, $($field:tt)*) => {
        tracing::info_span!(
            "stream",
            route = %$route,
            stream_id = %uuid::Uuid::new_v4(),
            consumer = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Create a tracing span for a single phase call.
#[macro_export]
macro_rules! phase_span {
    ($phase:expr) => {
        tracing::debug_span!("phase", phase = %$phase)
    };
    ($phase:expr, $($field:tt)*) => {
        tracing::debug_span!("phase", phase = %$phase, $($field)*)
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Installing twice
/// is an error, not a panic.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let res = if config.json_logging {
        registry.with(tracing_subscriber::fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).try_init()
    };
    res.map_err(|e| Error::config(format!("Failed to install log subscriber: {}", e)))
}

/// Log settings at startup
pub fn log_settings_info(settings: &crate::config::ManagerSettings) {
    tracing::info!(
        log_level = %settings.observability.log_level,
        json_logging = %settings.observability.json_logging,
        worker_threads = %settings.dispatch.worker_threads,
        pool_max_idle = %settings.pool.max_idle,
        debug_mode = %settings.debug_mode,
        "filter chain orchestrator configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_macros() {
        let span = crate::stream_span!("route-a");
        let _guard = span.enter();
        let phase = crate::phase_span!(crate::api::Phase::DECODE_HEADERS, plugin = "demo");
        let _phase = phase.enter();
    }

    #[test]
    fn test_invalid_level_rejected() {
        // RUST_LOG would mask the configured level
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ObservabilityConfig { log_level: "demo=loud".to_string(), ..Default::default() };
        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
