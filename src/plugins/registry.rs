//! Plugin registry
//!
//! Plugins are registered by name at startup and looked up by the config
//! compiler. A process-wide registry is available through
//! [`PluginRegistry::global`]; tests and embedders that need isolation build
//! their own.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::order::OrderPosition;
use super::Plugin;
use crate::api::Phase;
use crate::errors::{Error, Result};

static GLOBAL: Lazy<Arc<PluginRegistry>> = Lazy::new(|| Arc::new(PluginRegistry::new()));

#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Arc<PluginRegistry> {
        &GLOBAL
    }

    pub fn register<P: Plugin>(&self, name: &str, plugin: P) -> Result<()> {
        self.register_arc(name, Arc::new(plugin))
    }

    /// Register a plugin after checking that its declarations are coherent.
    /// Registering a name twice replaces the earlier plugin.
    pub fn register_arc(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::registration(name, "plugin name should not be empty"));
        }

        let order = plugin.order();
        let phases = plugin.factory().phases();

        if plugin.as_consumer().is_some() && order.position != OrderPosition::Authn {
            return Err(Error::registration(
                name,
                "invalid plugin order position: consumer plugin should use Authn",
            ));
        }
        if order.position == OrderPosition::Authn && !phases.contains(Phase::DECODE_HEADERS) {
            return Err(Error::registration(name, "Authn plugin should run in the DecodeHeaders phase"));
        }
        if phases.contains(Phase::DECODE_REQUEST) && !phases.contains(Phase::DECODE_HEADERS) {
            return Err(Error::registration(
                name,
                "DecodeRequest only runs after DecodeHeaders returns WaitAllData, so DecodeHeaders must be implemented",
            ));
        }
        if phases.contains(Phase::ENCODE_RESPONSE) && !phases.contains(Phase::ENCODE_HEADERS) {
            return Err(Error::registration(
                name,
                "EncodeResponse only runs after EncodeHeaders returns WaitAllData, so EncodeHeaders must be implemented",
            ));
        }

        if self.plugins.insert(name.to_string(), plugin).is_some() {
            warn!(plugin = %name, "plugin registered twice, replacing the previous one");
        } else {
            debug!(plugin = %name, phases = %phases, "registered plugin");
        }
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::plugin_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn is_consumer_plugin(&self, name: &str) -> bool {
        self.plugins.get(name).is_some_and(|p| p.as_consumer().is_some())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Chain order of two plugins: position, then operation, then name.
    /// Unregistered names only compare by name.
    pub fn compare_order(&self, a: &str, b: &str) -> Ordering {
        let oa = self.plugins.get(a).map(|p| p.order());
        let ob = self.plugins.get(b).map(|p| p.order());
        match (oa, ob) {
            (Some(oa), Some(ob)) => oa.cmp(&ob).then_with(|| a.cmp(b)),
            _ => a.cmp(b),
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.names()).finish()
    }
}
