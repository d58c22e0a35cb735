//! # Filter Contract
//!
//! Every method has a pass-through default, so a filter overrides only the
//! phases it cares about. Which phases a filter actually overrides is not
//! discovered at runtime: its [`FilterFactory`](crate::plugins::FilterFactory)
//! declares them as a [`Phase`](super::Phase) mask, and the manager uses that
//! mask to skip phases nobody implements.
//!
//! `decode_request` and `encode_response` are only called after the same
//! filter returned [`ResultAction::WaitAllData`] from the matching headers
//! phase. They then receive the whole body and trailers at once, instead of
//! the streaming `*_data`/`*_trailers` calls.

use super::action::ResultAction;
use super::buffer::Buffer;
use super::headers::{RequestHeaderMap, RequestTrailerMap, ResponseHeaderMap, ResponseTrailerMap};

pub trait Filter: Send {
    fn decode_headers(&mut self, _headers: &RequestHeaderMap, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn decode_data(&mut self, _data: &Buffer, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn decode_trailers(&mut self, _trailers: &RequestTrailerMap) -> ResultAction {
        ResultAction::Continue
    }

    fn decode_request(
        &mut self,
        _headers: &RequestHeaderMap,
        _data: Option<&Buffer>,
        _trailers: Option<&RequestTrailerMap>,
    ) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_headers(&mut self, _headers: &ResponseHeaderMap, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_data(&mut self, _data: &Buffer, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_trailers(&mut self, _trailers: &ResponseTrailerMap) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_response(
        &mut self,
        _headers: &ResponseHeaderMap,
        _data: Option<&Buffer>,
        _trailers: Option<&ResponseTrailerMap>,
    ) -> ResultAction {
        ResultAction::Continue
    }

    fn on_log(
        &mut self,
        _req_headers: Option<&RequestHeaderMap>,
        _req_trailers: Option<&RequestTrailerMap>,
        _resp_headers: Option<&ResponseHeaderMap>,
        _resp_trailers: Option<&ResponseTrailerMap>,
    ) {
    }
}

/// A filter that does nothing in every phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughFilter;

impl Filter for PassThroughFilter {}
