//! # Filter API
//!
//! The types a plugin author works with: phases, result actions, the
//! [`Filter`] trait, header and body handles, and the callback surfaces.

pub mod action;
pub mod buffer;
pub mod callbacks;
pub mod filter;
pub mod headers;
pub mod phase;

pub use action::{LocalResponse, ResultAction};
pub use buffer::Buffer;
pub use callbacks::{
    ExecutionRecord, FilterCallbackHandler, HostStream, LocalReply, PluginState, StreamInfo,
};
pub use filter::{Filter, PassThroughFilter};
pub use headers::{
    HeaderMap, RequestHeaderMap, RequestTrailerMap, ResponseHeaderMap, ResponseTrailerMap,
    TrailerMap,
};
pub use phase::Phase;
