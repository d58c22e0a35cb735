//! Plugin ordering
//!
//! Where a plugin sits in a chain is decided by its declared position, then
//! its operation inside that position, then its name. The order is total, so
//! sorting any list of plugin names gives the same result regardless of how
//! the list was assembled.

use serde::{Deserialize, Serialize};

/// Coarse slot of a plugin in the chain, earliest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPosition {
    Listener,
    Network,
    /// First slot reachable by HTTP filters.
    Outer,
    Access,
    /// Authentication. Consumer plugins must sit here.
    Authn,
    Authz,
    Traffic,
    Transform,
    #[default]
    Unspecified,
    BeforeUpstream,
    Stats,
    /// Last slot before the upstream.
    Inner,
}

/// Fine-grained placement inside a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOperation {
    InsertFirst,
    #[default]
    Nop,
    InsertLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PluginOrder {
    pub position: OrderPosition,
    #[serde(default)]
    pub operation: OrderOperation,
}

impl PluginOrder {
    pub const fn new(position: OrderPosition) -> Self {
        Self { position, operation: OrderOperation::Nop }
    }

    pub const fn with_operation(mut self, operation: OrderOperation) -> Self {
        self.operation = operation;
        self
    }
}
