//! Sentinel filter standing in for a plugin whose configuration could not be
//! used. It answers every request with a 500 so one broken plugin does not
//! take the rest of the chain down with it.

use tracing::error;

use crate::api::{Filter, LocalResponse, Phase, RequestHeaderMap, ResultAction};
use crate::plugins::{FilterFactory, ParsedConfig};

use super::model::ParsedFilterConfig;

pub(crate) struct InternalErrorFilter {
    plugin: String,
    reason: String,
}

impl Filter for InternalErrorFilter {
    fn decode_headers(&mut self, _headers: &RequestHeaderMap, _end_stream: bool) -> ResultAction {
        error!(plugin = %self.plugin, reason = %self.reason, "rejecting request: plugin is unusable");
        ResultAction::LocalResponse(LocalResponse::new(500))
    }
}

pub(crate) fn internal_error_factory(plugin: &str, reason: &str) -> FilterFactory {
    let plugin = plugin.to_string();
    let reason = reason.to_string();
    FilterFactory::new(Phase::DECODE_HEADERS, move |_, _| {
        Box::new(InternalErrorFilter { plugin: plugin.clone(), reason: reason.clone() })
    })
}

/// A descriptor for `plugin` whose filter always replies 500.
pub(crate) fn internal_error_config(plugin: &str, reason: &str) -> ParsedFilterConfig {
    ParsedFilterConfig::new(
        plugin,
        ParsedConfig::empty(),
        internal_error_factory(plugin, reason),
        Phase::ALL,
    )
}
