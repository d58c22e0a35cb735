//! # Plugins
//!
//! A plugin is the registration-time half of a filter: it parses the
//! plugin's configuration, declares where the filter sits in a chain and
//! which phases it implements, and builds one filter instance per stream.
//!
//! ```rust,ignore
//! struct Demo;
//!
//! impl Plugin for Demo {
//!     fn parse_config(&self, raw: &serde_json::Value) -> Result<ParsedConfig> {
//!         parse_json_config::<DemoConfig>(raw)
//!     }
//!
//!     fn factory(&self) -> FilterFactory {
//!         FilterFactory::new(Phase::DECODE_HEADERS, |config, callbacks| {
//!             Box::new(DemoFilter::new(config, callbacks))
//!         })
//!     }
//! }
//!
//! PluginRegistry::global().register("demo", Demo)?;
//! ```

pub mod order;
pub mod registry;

pub use order::{OrderOperation, OrderPosition, PluginOrder};
pub use registry::PluginRegistry;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::api::{Filter, FilterCallbackHandler, Phase};
use crate::errors::{Error, Result};

/// Object-safe access to `Any` for trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A plugin's parsed configuration.
pub trait PluginConfig: AsAny + Send + Sync + fmt::Debug {
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Whether [`init`](Self::init) must run before the first request.
    fn needs_init(&self) -> bool {
        false
    }

    /// One-time initialization, run at most once per parsed config, before
    /// the first stream that uses it.
    fn init(&self) -> Result<()> {
        Ok(())
    }
}

impl dyn PluginConfig {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }
}

/// Configuration for plugins that take none, and for sentinel filters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConfig;

impl PluginConfig for EmptyConfig {}

/// Shared handle to a parsed plugin configuration.
#[derive(Clone)]
pub struct ParsedConfig(Arc<dyn PluginConfig>);

impl ParsedConfig {
    pub fn new<T: PluginConfig + 'static>(config: T) -> Self {
        Self(Arc::new(config))
    }

    pub fn empty() -> Self {
        Self::new(EmptyConfig)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().downcast_ref::<T>()
    }

    pub fn get(&self) -> &dyn PluginConfig {
        self.0.as_ref()
    }
}

impl fmt::Debug for ParsedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Deserialize a plugin config from JSON and validate it.
///
/// `null` yields the type's default. Unknown fields are ignored.
pub fn parse_json_config<T>(raw: &serde_json::Value) -> Result<ParsedConfig>
where
    T: PluginConfig + DeserializeOwned + Default + 'static,
{
    let config: T = if raw.is_null() {
        T::default()
    } else {
        serde_json::from_value(raw.clone()).map_err(|source| Error::Serialization {
            source,
            context: "failed to deserialize plugin config".to_string(),
        })?
    };
    config.validate()?;
    Ok(ParsedConfig::new(config))
}

type BuildFn = dyn Fn(&ParsedConfig, Arc<dyn FilterCallbackHandler>) -> Box<dyn Filter> + Send + Sync;

/// Builds filter instances and declares which phases they implement.
///
/// The declared phases drive the skip flags: when no filter in a chain
/// declares a phase, the phase is skipped even if a filter type overrides
/// the method.
#[derive(Clone)]
pub struct FilterFactory {
    phases: Phase,
    build: Arc<BuildFn>,
}

impl FilterFactory {
    pub fn new<F>(phases: Phase, build: F) -> Self
    where
        F: Fn(&ParsedConfig, Arc<dyn FilterCallbackHandler>) -> Box<dyn Filter> + Send + Sync + 'static,
    {
        Self { phases, build: Arc::new(build) }
    }

    pub fn phases(&self) -> Phase {
        self.phases
    }

    pub fn create(&self, config: &ParsedConfig, callbacks: Arc<dyn FilterCallbackHandler>) -> Box<dyn Filter> {
        (self.build)(config, callbacks)
    }
}

impl fmt::Debug for FilterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFactory").field("phases", &self.phases).finish()
    }
}

/// A registered plugin.
pub trait Plugin: Send + Sync + 'static {
    fn order(&self) -> PluginOrder {
        PluginOrder::default()
    }

    fn parse_config(&self, raw: &serde_json::Value) -> Result<ParsedConfig>;

    fn factory(&self) -> FilterFactory;

    /// Phases this plugin's filter never blocks in, so they may run on the
    /// host thread.
    fn non_blocking_phases(&self) -> Phase {
        Phase::NONE
    }

    /// Consumer plugins authenticate callers and return `Some(self)`.
    fn as_consumer(&self) -> Option<&dyn ConsumerPlugin> {
        None
    }
}

/// An authentication plugin that identifies consumers.
pub trait ConsumerPlugin: Plugin {
    /// Parse the per-consumer credentials this plugin keeps for one consumer.
    fn parse_consumer_config(&self, raw: &serde_json::Value) -> Result<Arc<dyn PluginConsumerConfig>>;
}

/// A consumer's credentials for one consumer plugin.
pub trait PluginConsumerConfig: AsAny + Send + Sync + fmt::Debug {
    /// Key the consumer is looked up by, e.g. an API key.
    fn index(&self) -> String;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl dyn PluginConsumerConfig {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }
}

/// Deserialize and validate consumer credentials from JSON.
pub fn parse_consumer_json<T>(raw: &serde_json::Value) -> Result<Arc<dyn PluginConsumerConfig>>
where
    T: PluginConsumerConfig + DeserializeOwned + 'static,
{
    let config: T = serde_json::from_value(raw.clone()).map_err(|source| Error::Serialization {
        source,
        context: "failed to deserialize consumer config".to_string(),
    })?;
    config.validate()?;
    Ok(Arc::new(config))
}
