//! # filterchain
//!
//! A lifecycle orchestrator for chains of pluggable HTTP filters running
//! inside a proxy. The host hands each stream's phases (request headers,
//! body, trailers, the mirrored response phases and the final log phase) to
//! a [`FilterManager`], which runs them through the configured filters.
//!
//! ## Architecture
//!
//! ```text
//! plugin list ─► Config Compiler ─► FilterManagerConfig (shared, immutable)
//!                                        │
//! host stream ─► FilterManager ──────────┤ per stream, pooled state
//!                   │  decode: filters 0..n     encode: filters n..0
//!                   └─ inline, or on the background runtime when a
//!                      filter may block
//! ```
//!
//! ## Core Components
//!
//! - **Plugins** ([`plugins`]): named filter factories with a declared set of
//!   implemented phases and an order in the chain.
//! - **Config Compiler** ([`FilterManagerConfig::compile`] and
//!   [`FilterManagerConfig::merge`]): turns a plugin list into a chain.
//! - **Filter Manager** ([`FilterManager`]): skips phases nobody implements,
//!   buffers whole bodies for filters that ask for them, splices in
//!   consumer filters after authentication and turns panics into 500s.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use filterchain::{FilterManager, FilterManagerConfig, ManagerContext, PhaseStatus};
//! # use filterchain::api::{HostStream, LocalReply, StreamInfo, RequestHeaderMap};
//! # struct Host;
//! # impl HostStream for Host {
//! #     fn send_local_reply(&self, _reply: LocalReply) {}
//! #     fn stream_info(&self) -> StreamInfo { StreamInfo::default() }
//! #     fn set_metadata(&self, _ns: &str, _key: &str, _value: serde_json::Value) {}
//! # }
//!
//! # fn main() -> filterchain::Result<()> {
//! let ctx = ManagerContext::global()?;
//! let config = FilterManagerConfig::parse(&ctx, r#"{"plugins": [{"name": "demo"}]}"#)?;
//! let stream = FilterManager::new(&config, Arc::new(Host));
//! let status = stream.decode_headers(RequestHeaderMap::default(), true).wait();
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod filtermanager;
pub mod observability;
pub mod plugins;

// Re-export commonly used types and traits
pub use config::ManagerSettings;
pub use errors::{Error, Result};
pub use filtermanager::{
    FilterChainConfig, FilterManager, FilterManagerConfig, ManagerContext, PhaseStatus,
    StreamStatus,
};
pub use plugins::{Plugin, PluginRegistry};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
