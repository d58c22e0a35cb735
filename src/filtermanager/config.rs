//! # Config Compiler
//!
//! Compiles a plugin list into an immutable [`FilterManagerConfig`], and
//! merges a route-level config over a parent (e.g. listener-level) one.
//!
//! Per-plugin failures never abort compilation: an unknown plugin is logged
//! and dropped, and a plugin whose config does not parse is replaced by a
//! sentinel filter that answers 500.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info};

use super::dispatch::Dispatcher;
use super::internal_error::internal_error_config;
use super::model::{ChainCapabilities, FilterChainConfig, ParsedFilterConfig};
use super::state::StreamState;
use crate::api::Phase;
use crate::config::ManagerSettings;
use crate::consumer::{ConsumerRegistry, ConsumerStore};
use crate::errors::{panic_message, Error, Result};
use crate::plugins::{ParsedConfig, Plugin, PluginRegistry};

/// A plugin with this name turns on debug timing for its chain.
pub const DEBUG_MODE_PLUGIN: &str = "debugMode";

/// Process-level collaborators shared by every compiled config.
#[derive(Clone)]
pub struct ManagerContext {
    plugins: Arc<PluginRegistry>,
    consumers: Arc<dyn ConsumerRegistry>,
    dispatcher: Dispatcher,
    settings: Arc<ManagerSettings>,
}

impl ManagerContext {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        consumers: Arc<dyn ConsumerRegistry>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self { plugins, consumers, dispatcher, settings: Arc::new(ManagerSettings::default()) }
    }

    /// Build a context with a background runtime sized by `settings`.
    pub fn from_settings(
        settings: ManagerSettings,
        plugins: Arc<PluginRegistry>,
        consumers: Arc<dyn ConsumerRegistry>,
    ) -> Result<Self> {
        settings.validate()?;
        let dispatcher = Dispatcher::background(&settings.dispatch)?;
        Ok(Self { plugins, consumers, dispatcher, settings: Arc::new(settings) })
    }

    /// The global plugin registry, an empty consumer store and default settings.
    pub fn global() -> Result<Self> {
        Self::from_settings(
            ManagerSettings::default(),
            Arc::clone(PluginRegistry::global()),
            Arc::new(ConsumerStore::new()),
        )
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn consumers(&self) -> &Arc<dyn ConsumerRegistry> {
        &self.consumers
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("plugins", &self.plugins)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Why a config's deferred init failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFailure {
    pub plugin: String,
    pub message: String,
}

/// Runs every deferred init of a config once; later callers see the outcome.
#[derive(Debug, Default)]
pub(crate) struct InitGate {
    outcome: OnceCell<Option<InitFailure>>,
}

impl InitGate {
    fn run(&self, dispatcher: &Dispatcher, parsed: &[Arc<ParsedFilterConfig>]) -> Option<&InitFailure> {
        self.outcome
            .get_or_init(|| {
                let pending: Vec<Arc<ParsedFilterConfig>> =
                    parsed.iter().filter(|fc| fc.needs_init()).cloned().collect();
                // Inits may block on I/O, so run them side by side.
                let jobs: Vec<_> = pending
                    .iter()
                    .map(|fc| {
                        let fc = Arc::clone(fc);
                        move || fc.init_once()
                    })
                    .collect();
                let results = dispatcher.run_all("plugin init", jobs);
                pending.iter().zip(results).find_map(|(fc, res)| {
                    res.err().map(|e| InitFailure { plugin: fc.name.clone(), message: e.to_string() })
                })
            })
            .as_ref()
    }

    fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    fn failure(&self) -> Option<&InitFailure> {
        self.outcome.get().and_then(Option::as_ref)
    }
}

/// Reset stream states kept for reuse by later streams of the same config.
#[derive(Debug)]
pub(crate) struct StatePool {
    free: Mutex<Vec<StreamState>>,
    max_idle: usize,
}

impl StatePool {
    fn new(max_idle: usize) -> Self {
        Self { free: Mutex::new(Vec::new()), max_idle }
    }

    pub(crate) fn acquire(&self) -> StreamState {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).pop().unwrap_or_default()
    }

    pub(crate) fn release(&self, mut state: StreamState) {
        state.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(state);
        }
    }

    pub(crate) fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A compiled filter chain. Immutable; merging builds a new one.
pub struct FilterManagerConfig {
    namespace: String,
    parsed: Vec<Arc<ParsedFilterConfig>>,
    consumer_filters_end_at: usize,
    init_gate: Option<InitGate>,
    enable_debug_mode: bool,
    capabilities: ChainCapabilities,
    context: ManagerContext,
    pub(crate) pool: StatePool,
}

impl FilterManagerConfig {
    fn assemble(
        context: &ManagerContext,
        namespace: String,
        parsed: Vec<Arc<ParsedFilterConfig>>,
        consumer_filters_end_at: usize,
        needs_init: bool,
        enable_debug_mode: bool,
    ) -> Self {
        let capabilities = ChainCapabilities::of(parsed.iter().map(|fc| fc.as_ref()));
        Self {
            namespace,
            parsed,
            consumer_filters_end_at,
            init_gate: needs_init.then(InitGate::default),
            enable_debug_mode: enable_debug_mode || context.settings.debug_mode,
            capabilities,
            pool: StatePool::new(context.settings.pool.max_idle),
            context: context.clone(),
        }
    }

    /// A config with no filters.
    pub fn empty(context: &ManagerContext) -> Arc<Self> {
        Arc::new(Self::assemble(context, String::new(), Vec::new(), 0, false, false))
    }

    /// Compile a plugin list.
    pub fn compile(context: &ManagerContext, chain: &FilterChainConfig) -> Arc<Self> {
        let mut parsed: Vec<Arc<ParsedFilterConfig>> = Vec::with_capacity(chain.plugins.len());
        let mut consumer_filters_end_at = 0;
        let mut needs_init = false;
        let mut enable_debug_mode = false;

        for entry in &chain.plugins {
            let plugin = match context.plugins.load(&entry.name) {
                Ok(plugin) => plugin,
                Err(e) => {
                    error!(plugin = %entry.name, error = %e, "dropping unknown plugin from chain");
                    continue;
                }
            };
            if entry.name == DEBUG_MODE_PLUGIN {
                enable_debug_mode = true;
            }

            let fc = match parse_plugin_config(plugin.as_ref(), &entry.name, &entry.config) {
                Ok(config) => {
                    if plugin.as_consumer().is_some() {
                        consumer_filters_end_at = parsed.len() + 1;
                    }
                    if config.get().needs_init() {
                        needs_init = true;
                    }
                    ParsedFilterConfig::new(
                        entry.name.clone(),
                        config,
                        plugin.factory(),
                        plugin.non_blocking_phases(),
                    )
                }
                Err(e) => {
                    error!(plugin = %entry.name, error = %e, "replacing plugin with an internal error filter");
                    internal_error_config(&entry.name, &e.to_string())
                }
            };
            parsed.push(Arc::new(fc));
        }

        let config = Self::assemble(
            context,
            chain.namespace.clone(),
            parsed,
            consumer_filters_end_at,
            needs_init,
            enable_debug_mode,
        );
        debug!(
            namespace = %config.namespace,
            filters = ?config.filter_names(),
            consumer_filters_end_at = config.consumer_filters_end_at,
            "compiled filter chain"
        );
        Arc::new(config)
    }

    /// Compile from the JSON wire format.
    pub fn parse(context: &ManagerContext, raw: &str) -> Result<Arc<Self>> {
        let chain: FilterChainConfig = serde_json::from_str(raw).map_err(|source| {
            Error::Serialization { source, context: "invalid filter chain config".to_string() }
        })?;
        Ok(Self::compile(context, &chain))
    }

    /// Lay `child` over `parent`: every child filter, plus the parent's
    /// filters the child does not name, in plugin order. Neither input is
    /// modified.
    pub fn merge(parent: &Arc<Self>, child: &Arc<Self>) -> Arc<Self> {
        if parent.parsed.is_empty() {
            return Arc::clone(child);
        }

        let registry = &child.context.plugins;
        let names: HashSet<&str> = child.parsed.iter().map(|fc| fc.name.as_str()).collect();
        let mut parsed: Vec<Arc<ParsedFilterConfig>> = child.parsed.clone();
        parsed.extend(parent.parsed.iter().filter(|fc| !names.contains(fc.name.as_str())).cloned());
        parsed.sort_by(|a, b| registry.compare_order(&a.name, &b.name));

        let consumer_filters_end_at = parsed
            .iter()
            .position(|fc| !registry.is_consumer_plugin(&fc.name))
            .unwrap_or(parsed.len());

        let namespace =
            if child.namespace.is_empty() { parent.namespace.clone() } else { child.namespace.clone() };

        Arc::new(Self::assemble(
            &child.context,
            namespace,
            parsed,
            consumer_filters_end_at,
            child.init_gate.is_some() || parent.init_gate.is_some(),
            child.enable_debug_mode || parent.enable_debug_mode,
        ))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn parsed(&self) -> &[Arc<ParsedFilterConfig>] {
        &self.parsed
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.parsed.iter().map(|fc| fc.name.as_str()).collect()
    }

    pub fn consumer_filters_end_at(&self) -> usize {
        self.consumer_filters_end_at
    }

    pub fn debug_mode(&self) -> bool {
        self.enable_debug_mode
    }

    pub fn capabilities(&self) -> ChainCapabilities {
        self.capabilities
    }

    pub fn context(&self) -> &ManagerContext {
        &self.context
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.context.plugins
    }

    /// Number of reset stream states waiting for reuse.
    pub fn idle_managers(&self) -> usize {
        self.pool.idle()
    }

    /// True while a deferred init has not run yet.
    pub fn init_pending(&self) -> bool {
        self.init_gate.as_ref().is_some_and(|gate| !gate.is_done())
    }

    /// Run deferred inits if they have not run yet; returns the failure, if any.
    pub fn ensure_init(&self) -> Option<&InitFailure> {
        let gate = self.init_gate.as_ref()?;
        let failure = gate.run(&self.context.dispatcher, &self.parsed);
        if let Some(f) = failure {
            info!(plugin = %f.plugin, error = %f.message, "filter chain unusable: init failed");
        }
        failure
    }

    pub fn init_failure(&self) -> Option<&InitFailure> {
        self.init_gate.as_ref().and_then(InitGate::failure)
    }

    /// Whether `DecodeHeaders` has no work at all: nothing implements it,
    /// there are no authn filters and no init is outstanding or failed.
    pub(crate) fn can_skip_decode_headers(&self) -> bool {
        self.capabilities.can_skip(Phase::DECODE_HEADERS)
            && self.consumer_filters_end_at == 0
            && self.init_gate.is_none()
    }
}

impl std::fmt::Debug for FilterManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterManagerConfig")
            .field("namespace", &self.namespace)
            .field("filters", &self.filter_names())
            .field("consumer_filters_end_at", &self.consumer_filters_end_at)
            .field("debug_mode", &self.enable_debug_mode)
            .finish()
    }
}

/// Parse one plugin's config, turning a parser panic into an error.
fn parse_plugin_config(
    plugin: &dyn Plugin,
    name: &str,
    raw: &serde_json::Value,
) -> Result<ParsedConfig> {
    match catch_unwind(AssertUnwindSafe(|| plugin.parse_config(raw))) {
        Ok(res) => res.map_err(|e| Error::config_parse(name, e.to_string())),
        Err(payload) => {
            error!(plugin = %name, panic = %panic_message(payload.as_ref()), "plugin config parser panic");
            Err(Error::config_parse(name, "plugin config parser panic"))
        }
    }
}
