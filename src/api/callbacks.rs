//! # Callback Surfaces
//!
//! [`HostStream`] is what the embedding proxy implements for each stream.
//! [`FilterCallbackHandler`] is what the manager gives every filter it builds.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::phase::Phase;
use crate::consumer::Consumer;

/// Read-only facts about the stream supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub route_name: String,
    pub virtual_cluster_name: Option<String>,
    pub filter_chain_name: String,
    pub downstream_remote_address: Option<String>,
}

/// A reply the host must send to the client in place of the upstream response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalReply {
    pub status: u16,
    pub body: String,
    pub headers: http::HeaderMap,
    /// Short reason, usable as response code details.
    pub details: String,
}

/// Services the embedding proxy provides for one stream.
pub trait HostStream: Send + Sync {
    fn send_local_reply(&self, reply: LocalReply);

    fn stream_info(&self) -> StreamInfo;

    /// Record stream-scoped metadata, e.g. for access logs.
    fn set_metadata(&self, namespace: &str, key: &str, value: serde_json::Value);
}

/// Per-filter, per-phase timings collected in debug mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub plugin_name: String,
    pub record: BTreeMap<String, Duration>,
}

impl ExecutionRecord {
    pub fn elapsed(&self, phase: Phase) -> Option<Duration> {
        phase.name().and_then(|name| self.record.get(name).copied())
    }

    pub fn total(&self) -> Duration {
        self.record.values().sum()
    }
}

/// Stream-scoped key/value storage shared by the filters of one stream.
///
/// Keys are namespaced by plugin name so plugins cannot clobber each other
/// by accident.
#[derive(Default)]
pub struct PluginState {
    entries: Mutex<HashMap<(String, String), Arc<dyn Any + Send + Sync>>>,
}

impl PluginState {
    pub fn set<T: Any + Send + Sync>(&self, plugin: &str, key: &str, value: T) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((plugin.to_string(), key.to_string()), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, plugin: &str, key: &str) -> Option<Arc<T>> {
        let value = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(plugin.to_string(), key.to_string()))
            .cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl std::fmt::Debug for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("PluginState").field("entries", &len).finish()
    }
}

/// What a filter can ask of the stream it runs in.
pub trait FilterCallbackHandler: Send + Sync {
    fn stream_info(&self) -> StreamInfo;

    /// Find a consumer registered by `plugin_name` under `key` in this config's namespace.
    fn lookup_consumer(&self, plugin_name: &str, key: &str) -> Option<Arc<Consumer>>;

    /// Attach the authenticated consumer. The manager merges its filters once
    /// the authn filters finish.
    fn set_consumer(&self, consumer: Arc<Consumer>);

    fn consumer(&self) -> Option<Arc<Consumer>>;

    fn plugin_state(&self) -> &PluginState;

    fn set_metadata(&self, namespace: &str, key: &str, value: serde_json::Value);

    /// Timings gathered so far; empty unless debug mode is on.
    fn execution_records(&self) -> Vec<ExecutionRecord>;
}
