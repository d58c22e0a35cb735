//! # Filter Manager
//!
//! Drives a compiled filter chain through the lifecycle of one HTTP stream.
//!
//! A [`FilterManagerConfig`] is compiled once per route or listener config
//! and shared by every stream on it. Each stream gets a [`FilterManager`]
//! that instantiates the chain, walks it forward for decode phases and in
//! reverse for encode phases, buffers whole bodies for filters that ask for
//! them, and splices in a consumer's own filters once an authn filter has
//! identified the caller.
//!
//! Every phase call returns a [`PhaseStatus`]: either the final status, or a
//! [`Completion`] when the phase was handed to a background thread because
//! some filter in it may block.

mod callbacks;
pub mod config;
pub mod dispatch;
pub(crate) mod internal_error;
mod local_reply;
pub mod manager;
pub mod model;
mod state;
pub mod wrapper;

pub use config::{FilterManagerConfig, InitFailure, ManagerContext, DEBUG_MODE_PLUGIN};
pub use dispatch::{Completion, Dispatcher};
pub use manager::FilterManager;
pub use model::{
    ChainCapabilities, FilterChainConfig, FilterConfigEntry, FilterWrapper, ParsedFilterConfig,
};
pub use wrapper::{DebugFilter, ExecutionRecorder, LogExecutionFilter};

/// Dynamic metadata namespace the manager reports under.
pub const METADATA_NAMESPACE: &str = "filterchain";
/// Metadata key naming the filter that sent a local reply.
pub const LOCAL_REPLY_PLUGIN_KEY: &str = "local_reply_plugin_name";
/// Metadata key naming the plugin whose init failed.
pub const INIT_FAILED_PLUGIN_KEY: &str = "init_failed_plugin_name";

/// What the host should do with the stream after a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Forward the headers, data or trailers.
    Continue,
    /// Hold the data; the manager wants the rest of the body first.
    StopAndBuffer,
    /// Hold the headers without buffering; resumed by the next data chunk.
    StopNoBuffer,
    /// A local reply was sent; stop processing this direction.
    LocalReply,
}

/// The outcome of a phase call.
#[derive(Debug)]
pub enum PhaseStatus {
    Ready(StreamStatus),
    Pending(Completion),
}

impl PhaseStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, PhaseStatus::Pending(_))
    }

    /// The final status, blocking on a background phase if necessary.
    ///
    /// Must not be called from inside an async context.
    pub fn wait(self) -> StreamStatus {
        match self {
            PhaseStatus::Ready(status) => status,
            PhaseStatus::Pending(completion) => completion.wait(),
        }
    }

    /// The final status, awaiting a background phase if necessary.
    pub async fn resolve(self) -> StreamStatus {
        match self {
            PhaseStatus::Ready(status) => status,
            PhaseStatus::Pending(completion) => completion.await,
        }
    }
}

impl From<StreamStatus> for PhaseStatus {
    fn from(status: StreamStatus) -> Self {
        PhaseStatus::Ready(status)
    }
}
