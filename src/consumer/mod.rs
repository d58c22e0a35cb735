//! # Consumers
//!
//! A consumer is an authenticated caller. It carries credentials for one or
//! more consumer plugins, and optionally a filter chain of its own that is
//! merged into a stream's chain once an authn filter identifies it.
//!
//! The consumer's chain is compiled lazily, once per consumer object, and
//! cached as a [`ConsumerChainPlan`]: every stream that identifies the same
//! consumer reuses the same descriptors and capability flags.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::filtermanager::internal_error::internal_error_config;
use crate::filtermanager::model::{ChainCapabilities, ParsedFilterConfig};
use crate::plugins::{PluginConsumerConfig, PluginRegistry};

/// The wire form of a consumer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerSpec {
    /// Consumer plugin name to that plugin's credentials.
    #[serde(default)]
    pub auth: BTreeMap<String, serde_json::Value>,
    /// Plugin name to that plugin's config, applied to this consumer only.
    #[serde(default)]
    pub filters: BTreeMap<String, ConsumerFilterEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerFilterEntry {
    #[serde(default)]
    pub config: serde_json::Value,
}

/// The consumer's own filters, compiled once.
#[derive(Debug)]
pub struct ConsumerChainPlan {
    /// In chain order. A filter whose init failed is replaced by a sentinel.
    pub filters: Vec<Arc<ParsedFilterConfig>>,
    pub capabilities: ChainCapabilities,
}

pub struct Consumer {
    name: String,
    namespace: String,
    consumer_configs: HashMap<String, Arc<dyn PluginConsumerConfig>>,
    filter_configs: Vec<Arc<ParsedFilterConfig>>,
    chain_plan: OnceCell<ConsumerChainPlan>,
}

impl Consumer {
    /// Parse a consumer's credentials and filters against `registry`.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: &ConsumerSpec,
        registry: &PluginRegistry,
    ) -> Result<Self> {
        let name = name.into();

        let mut consumer_configs = HashMap::with_capacity(spec.auth.len());
        for (plugin_name, raw) in &spec.auth {
            let plugin = registry.load(plugin_name)?;
            let consumer_plugin = plugin.as_consumer().ok_or_else(|| {
                Error::config(format!("plugin {} is not for consumer", plugin_name))
            })?;
            let conf = consumer_plugin
                .parse_consumer_config(raw)
                .map_err(|e| Error::config_parse(plugin_name, e.to_string()))?;
            consumer_configs.insert(plugin_name.clone(), conf);
        }

        let mut filter_configs = Vec::with_capacity(spec.filters.len());
        for (plugin_name, entry) in &spec.filters {
            let plugin = registry.load(plugin_name)?;
            let parsed = plugin.parse_config(&entry.config).map_err(|e| {
                Error::config_parse(plugin_name, format!("{} during parsing plugin in consumer", e))
            })?;
            filter_configs.push(Arc::new(ParsedFilterConfig::new(
                plugin_name.clone(),
                parsed,
                plugin.factory(),
                plugin.non_blocking_phases(),
            )));
        }
        filter_configs.sort_by(|a, b| registry.compare_order(&a.name, &b.name));

        Ok(Self {
            name,
            namespace: namespace.into(),
            consumer_configs,
            filter_configs,
            chain_plan: OnceCell::new(),
        })
    }

    pub fn from_json(
        namespace: impl Into<String>,
        name: impl Into<String>,
        raw: &serde_json::Value,
        registry: &PluginRegistry,
    ) -> Result<Self> {
        let spec: ConsumerSpec = serde_json::from_value(raw.clone())?;
        Self::new(namespace, name, &spec, registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// This consumer's credentials for a consumer plugin.
    pub fn plugin_config(&self, plugin_name: &str) -> Option<Arc<dyn PluginConsumerConfig>> {
        self.consumer_configs.get(plugin_name).cloned()
    }

    pub fn filter_configs(&self) -> &[Arc<ParsedFilterConfig>] {
        &self.filter_configs
    }

    pub fn has_filters(&self) -> bool {
        !self.filter_configs.is_empty()
    }

    /// Whether building the chain plan still has deferred inits to run.
    pub fn init_pending(&self) -> bool {
        self.chain_plan.get().is_none() && self.filter_configs.iter().any(|fc| !fc.init_done())
    }

    /// The compiled consumer chain. Runs deferred inits on first use.
    pub fn chain_plan(&self) -> &ConsumerChainPlan {
        self.chain_plan.get_or_init(|| {
            let filters: Vec<Arc<ParsedFilterConfig>> = self
                .filter_configs
                .iter()
                .map(|fc| match fc.init_once() {
                    Ok(()) => Arc::clone(fc),
                    Err(e) => {
                        warn!(consumer = %self.name, plugin = %fc.name, error = %e, "consumer filter init failed");
                        Arc::new(internal_error_config(&fc.name, &e.to_string()))
                    }
                })
                .collect();
            let capabilities = ChainCapabilities::of(filters.iter().map(|fc| fc.as_ref()));
            debug!(
                consumer = %self.name,
                filters = filters.len(),
                implemented = %capabilities.implemented,
                "compiled consumer chain"
            );
            ConsumerChainPlan { filters, capabilities }
        })
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("auth", &self.consumer_configs.keys().collect::<Vec<_>>())
            .field("filters", &self.filter_configs.iter().map(|fc| &fc.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Looks consumers up for authn filters.
pub trait ConsumerRegistry: Send + Sync {
    fn lookup(&self, namespace: &str, plugin_name: &str, key: &str) -> Option<Arc<Consumer>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsumerKey {
    namespace: String,
    plugin: String,
    index: String,
}

/// An in-memory consumer index keyed by `(namespace, plugin, credential index)`.
#[derive(Debug, Default)]
pub struct ConsumerStore {
    index: DashMap<ConsumerKey, Arc<Consumer>>,
}

impl ConsumerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a consumer under each of its credentials, replacing any
    /// consumer previously indexed under the same key.
    pub fn insert(&self, consumer: Consumer) -> Arc<Consumer> {
        let consumer = Arc::new(consumer);
        for (plugin, conf) in &consumer.consumer_configs {
            let key = ConsumerKey {
                namespace: consumer.namespace.clone(),
                plugin: plugin.clone(),
                index: conf.index(),
            };
            if let Some(prev) = self.index.insert(key, Arc::clone(&consumer)) {
                if prev.name != consumer.name {
                    warn!(plugin = %plugin, previous = %prev.name, consumer = %consumer.name, "consumer credential reused");
                }
            }
        }
        consumer
    }

    /// Drop every index entry of the named consumer.
    pub fn remove(&self, namespace: &str, name: &str) {
        self.index.retain(|k, c| !(k.namespace == namespace && c.name == name));
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl ConsumerRegistry for ConsumerStore {
    fn lookup(&self, namespace: &str, plugin_name: &str, key: &str) -> Option<Arc<Consumer>> {
        let key = ConsumerKey {
            namespace: namespace.to_string(),
            plugin: plugin_name.to_string(),
            index: key.to_string(),
        };
        self.index.get(&key).map(|c| Arc::clone(c.value()))
    }
}
