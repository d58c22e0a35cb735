//! Filter chain data model: wire entries, compiled filter descriptors and
//! the per-stream filter wrapper.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::api::{Filter, Phase};
use crate::errors::{panic_message, Error, Result};
use crate::plugins::{FilterFactory, ParsedConfig};

/// One `{name, config}` entry of a plugin list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfigEntry {
    pub name: String,
    /// Opaque to the core; parsed by the plugin.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl FilterConfigEntry {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self { name: name.into(), config }
    }
}

/// The wire form of a filter chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterChainConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub plugins: Vec<FilterConfigEntry>,
}

/// A compiled, immutable filter descriptor.
///
/// Shared by every config it is merged into, so its one-time init runs once
/// no matter how many merged chains include it.
pub struct ParsedFilterConfig {
    pub name: String,
    pub parsed_config: ParsedConfig,
    pub factory: FilterFactory,
    /// Phases the filter never blocks in.
    pub sync_run_phases: Phase,
    init: OnceCell<std::result::Result<(), String>>,
}

impl ParsedFilterConfig {
    pub fn new(
        name: impl Into<String>,
        parsed_config: ParsedConfig,
        factory: FilterFactory,
        sync_run_phases: Phase,
    ) -> Self {
        Self { name: name.into(), parsed_config, factory, sync_run_phases, init: OnceCell::new() }
    }

    pub fn implemented_phases(&self) -> Phase {
        self.factory.phases()
    }

    pub fn needs_init(&self) -> bool {
        self.parsed_config.get().needs_init()
    }

    /// Run the config's deferred init once and return the memoized outcome.
    pub fn init_once(&self) -> Result<()> {
        let outcome = self.init.get_or_init(|| {
            if !self.needs_init() {
                return Ok(());
            }
            let started = std::time::Instant::now();
            let res = match catch_unwind(AssertUnwindSafe(|| self.parsed_config.get().init())) {
                Ok(res) => res.map_err(|e| e.to_string()),
                Err(payload) => Err(format!("panic during init: {}", panic_message(payload.as_ref()))),
            };
            match &res {
                Ok(()) => info!(plugin = %self.name, elapsed = ?started.elapsed(), "plugin initialized"),
                Err(e) => error!(plugin = %self.name, error = %e, "failed to init plugin"),
            }
            res
        });
        outcome.clone().map_err(|message| Error::init(&self.name, message))
    }

    /// Whether init has already run, successfully or not.
    pub fn init_done(&self) -> bool {
        !self.needs_init() || self.init.get().is_some()
    }
}

impl fmt::Debug for ParsedFilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedFilterConfig")
            .field("name", &self.name)
            .field("phases", &self.factory.phases())
            .field("sync_run_phases", &self.sync_run_phases)
            .finish()
    }
}

/// A filter instance paired with its plugin name.
pub struct FilterWrapper {
    pub name: Arc<str>,
    pub phases: Phase,
    pub filter: Box<dyn Filter>,
}

impl FilterWrapper {
    pub fn new(name: Arc<str>, phases: Phase, filter: Box<dyn Filter>) -> Self {
        Self { name, phases, filter }
    }
}

impl fmt::Debug for FilterWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterWrapper").field("name", &self.name).field("phases", &self.phases).finish()
    }
}

/// What a list of filters needs from the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainCapabilities {
    /// Phases at least one filter implements.
    pub implemented: Phase,
    /// Phases every implementing filter declares non-blocking.
    pub syncable: Phase,
}

impl ChainCapabilities {
    pub fn of<'a>(configs: impl IntoIterator<Item = &'a ParsedFilterConfig>) -> Self {
        let mut implemented = Phase::NONE;
        let mut blocking = Phase::NONE;
        for fc in configs {
            let phases = fc.implemented_phases();
            implemented |= phases;
            blocking |= phases & !fc.sync_run_phases;
        }
        Self { implemented, syncable: !blocking }
    }

    /// Combine with another chain's needs. Skip and sync guarantees only shrink.
    pub fn merge(self, other: ChainCapabilities) -> Self {
        Self { implemented: self.implemented | other.implemented, syncable: self.syncable & other.syncable }
    }

    pub fn can_skip(&self, phases: Phase) -> bool {
        !self.implemented.intersects(phases)
    }

    pub fn can_sync_run(&self, phases: Phase) -> bool {
        self.syncable.contains(phases)
    }
}
