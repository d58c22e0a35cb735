//! Per-stream chain state and the decode/encode state machines.
//!
//! Decode walks `filters` forward, encode walks it backward. Authn filters
//! are kept apart: they only see `DecodeHeaders` (and `OnLog`), and run
//! before everything else so a consumer's filters can be spliced into
//! `filters` before the rest of the chain sees the request.
//!
//! Whole-body buffering keeps one cursor per direction. The filter at the
//! cursor gets the body as a unit; filters before it get the body replayed
//! as one data call and one trailers call; headers then resume after the
//! cursor until another filter claims it.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::callbacks::StreamCallbacks;
use super::config::FilterManagerConfig;
use super::local_reply::build_local_reply;
use super::model::{ChainCapabilities, FilterWrapper, ParsedFilterConfig};
use super::wrapper::{DebugFilter, LogExecutionFilter};
use super::{StreamStatus, INIT_FAILED_PLUGIN_KEY, LOCAL_REPLY_PLUGIN_KEY, METADATA_NAMESPACE};
use crate::api::{
    Buffer, FilterCallbackHandler, LocalResponse, Phase, RequestHeaderMap, RequestTrailerMap,
    ResponseHeaderMap, ResponseTrailerMap, ResultAction,
};
use crate::consumer::Consumer;

/// Decorators applied to every filter of a stream.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Decoration {
    pub(crate) debug: bool,
    pub(crate) log: bool,
}

/// A unit of phase work, run with the stream state locked.
pub(crate) type Work = Box<dyn FnOnce(&mut StreamState, &PhaseContext<'_>) -> Step + Send>;

pub(crate) enum Step {
    Done(StreamStatus),
    /// The rest of the phase may block; run it in the background.
    Continue(Work),
}

/// How the manager should run a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Skip,
    Inline,
    Background,
}

/// Everything a phase needs besides the stream state.
pub(crate) struct PhaseContext<'a> {
    pub(crate) config: &'a FilterManagerConfig,
    pub(crate) callbacks: &'a Arc<StreamCallbacks>,
    /// Running on the host's thread.
    pub(crate) inline: bool,
}

impl PhaseContext<'_> {
    pub(crate) fn send_local_reply(
        &self,
        resp: LocalResponse,
        req_headers: Option<&RequestHeaderMap>,
        rsp_headers: Option<&ResponseHeaderMap>,
        plugin: Option<&str>,
    ) {
        let reply = build_local_reply(resp, req_headers, rsp_headers, plugin.unwrap_or_default());
        if let Some(name) = plugin {
            self.callbacks.set_metadata(
                METADATA_NAMESPACE,
                LOCAL_REPLY_PLUGIN_KEY,
                serde_json::Value::String(name.to_string()),
            );
        }
        debug!(status = reply.status, plugin = plugin.unwrap_or("-"), "sending local reply");
        self.callbacks.host().send_local_reply(reply);
    }

    pub(crate) fn build_filter(&self, fc: &ParsedFilterConfig, decoration: Decoration) -> FilterWrapper {
        let name: Arc<str> = Arc::from(fc.name.as_str());
        let handler: Arc<dyn FilterCallbackHandler> = Arc::clone(self.callbacks) as _;
        let mut filter = fc.factory.create(&fc.parsed_config, handler);
        if decoration.debug {
            filter = Box::new(DebugFilter::new(Arc::clone(&name), filter, self.callbacks.recorder()));
        }
        if decoration.log {
            let info = self.callbacks.stream_info();
            filter = Box::new(LogExecutionFilter::new(Arc::clone(&name), filter, &info));
        }
        FilterWrapper::new(name, fc.implemented_phases(), filter)
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Authn(usize),
    Chain(usize),
}

enum Flow {
    Next,
    Stop(StreamStatus),
}

/// Phases `DecodeHeaders` may run inline.
pub(crate) fn decode_headers_mask(end_stream: bool) -> Phase {
    if end_stream {
        Phase::DECODE_HEADERS | Phase::DECODE_REQUEST
    } else {
        Phase::DECODE_HEADERS
    }
}

const DECODE_WHOLE: Phase = Phase::DECODE_HEADERS
    .union(Phase::DECODE_DATA)
    .union(Phase::DECODE_TRAILERS)
    .union(Phase::DECODE_REQUEST);
const ENCODE_WHOLE: Phase = Phase::ENCODE_HEADERS
    .union(Phase::ENCODE_DATA)
    .union(Phase::ENCODE_TRAILERS)
    .union(Phase::ENCODE_RESPONSE);

#[derive(Default)]
pub(crate) struct StreamState {
    authn: Vec<FilterWrapper>,
    filters: Vec<FilterWrapper>,
    capabilities: ChainCapabilities,
    decoration: Decoration,
    broken: bool,
    consumer_merged: bool,
    decode_stopped: bool,
    encode_stopped: bool,

    req_headers: Option<RequestHeaderMap>,
    req_trailers: Option<RequestTrailerMap>,
    req_body: Option<Buffer>,
    decode_idx: Option<usize>,
    decode_request_needed: bool,

    rsp_headers: Option<ResponseHeaderMap>,
    rsp_trailers: Option<ResponseTrailerMap>,
    rsp_body: Option<Buffer>,
    encode_idx: Option<usize>,
    encode_wait_idx: Option<usize>,
    encode_response_needed: bool,
    encode_wait_data_needed: bool,
}

impl StreamState {
    /// Instantiate the config's chain for a new stream.
    pub(crate) fn populate(&mut self, ctx: &PhaseContext<'_>, decoration: Decoration) {
        self.decoration = decoration;
        self.capabilities = ctx.config.capabilities();
        let authn_end = ctx.config.consumer_filters_end_at();
        for (i, fc) in ctx.config.parsed().iter().enumerate() {
            let wrapper = ctx.build_filter(fc, decoration);
            if i < authn_end {
                self.authn.push(wrapper);
            } else {
                self.filters.push(wrapper);
            }
        }
    }

    /// Drop the chain; every request on this stream gets a 500.
    pub(crate) fn mark_broken(&mut self) {
        self.authn.clear();
        self.filters.clear();
        self.broken = true;
    }

    /// Back to a blank state, keeping allocations.
    pub(crate) fn reset(&mut self) {
        let mut authn = std::mem::take(&mut self.authn);
        let mut filters = std::mem::take(&mut self.filters);
        authn.clear();
        filters.clear();
        *self = Self { authn, filters, ..Self::default() };
    }

    pub(crate) fn filter_names(&self) -> Vec<String> {
        self.authn.iter().chain(&self.filters).map(|w| w.name.to_string()).collect()
    }

    fn plan(&self, skip: bool, sync_mask: Phase) -> Dispatch {
        if skip {
            Dispatch::Skip
        } else if self.capabilities.can_sync_run(sync_mask) {
            Dispatch::Inline
        } else {
            Dispatch::Background
        }
    }

    pub(crate) fn plan_decode_headers(&self, config: &FilterManagerConfig, end_stream: bool) -> Dispatch {
        if self.broken {
            return Dispatch::Inline;
        }
        let skip = config.can_skip_decode_headers() && self.capabilities.can_skip(Phase::DECODE_HEADERS);
        match self.plan(skip, decode_headers_mask(end_stream)) {
            Dispatch::Inline if config.init_pending() => Dispatch::Background,
            plan => plan,
        }
    }

    pub(crate) fn plan_decode_data(&self, end_stream: bool) -> Dispatch {
        match self.decode_idx {
            _ if self.decode_stopped => Dispatch::Inline,
            None => self.plan(
                self.capabilities.can_skip(Phase::DECODE_DATA | Phase::DECODE_REQUEST),
                Phase::DECODE_DATA,
            ),
            Some(_) if !end_stream => Dispatch::Inline,
            Some(_) => self.plan(false, DECODE_WHOLE),
        }
    }

    pub(crate) fn plan_decode_trailers(&self) -> Dispatch {
        match self.decode_idx {
            _ if self.decode_stopped => Dispatch::Inline,
            None => self.plan(
                self.capabilities.can_skip(Phase::DECODE_TRAILERS | Phase::DECODE_REQUEST),
                Phase::DECODE_TRAILERS,
            ),
            Some(_) => self.plan(false, DECODE_WHOLE),
        }
    }

    pub(crate) fn plan_encode_headers(&self, end_stream: bool) -> Dispatch {
        if self.encode_stopped {
            return Dispatch::Inline;
        }
        let mask = if end_stream {
            Phase::ENCODE_HEADERS | Phase::ENCODE_RESPONSE
        } else {
            Phase::ENCODE_HEADERS
        };
        self.plan(self.capabilities.can_skip(Phase::ENCODE_HEADERS), mask)
    }

    pub(crate) fn plan_encode_data(&self, end_stream: bool) -> Dispatch {
        if self.encode_stopped {
            return Dispatch::Inline;
        }
        if self.encode_wait_idx.is_some() {
            return self.plan(false, Phase::ENCODE_HEADERS | Phase::ENCODE_DATA);
        }
        match self.encode_idx {
            None => self.plan(
                self.capabilities.can_skip(Phase::ENCODE_DATA | Phase::ENCODE_RESPONSE),
                Phase::ENCODE_DATA,
            ),
            Some(_) if !end_stream => Dispatch::Inline,
            Some(_) => self.plan(false, ENCODE_WHOLE),
        }
    }

    pub(crate) fn plan_encode_trailers(&self) -> Dispatch {
        if self.encode_stopped {
            return Dispatch::Inline;
        }
        if self.encode_wait_idx.is_some() {
            return self.plan(false, Phase::ENCODE_HEADERS | Phase::ENCODE_TRAILERS);
        }
        match self.encode_idx {
            None => self.plan(
                self.capabilities.can_skip(Phase::ENCODE_TRAILERS | Phase::ENCODE_RESPONSE),
                Phase::ENCODE_TRAILERS,
            ),
            Some(_) => self.plan(false, ENCODE_WHOLE),
        }
    }

    pub(crate) fn plan_on_log(&self) -> Dispatch {
        self.plan(self.capabilities.can_skip(Phase::ON_LOG), Phase::ON_LOG)
    }

    /// Headers are cached even when the phase is skipped; later phases and
    /// local replies read them.
    pub(crate) fn store_request_headers(&mut self, headers: &RequestHeaderMap) {
        self.req_headers = Some(headers.clone());
    }

    pub(crate) fn store_response_headers(&mut self, headers: &ResponseHeaderMap) {
        self.rsp_headers = Some(headers.clone());
    }

    pub(crate) fn store_request_trailers(&mut self, trailers: &RequestTrailerMap) {
        self.req_trailers = Some(trailers.clone());
    }

    pub(crate) fn store_response_trailers(&mut self, trailers: &ResponseTrailerMap) {
        self.rsp_trailers = Some(trailers.clone());
    }

    fn wrapper_name(&self, origin: Origin) -> Arc<str> {
        match origin {
            Origin::Authn(i) => Arc::clone(&self.authn[i].name),
            Origin::Chain(i) => Arc::clone(&self.filters[i].name),
        }
    }

    /// Apply a filter's result action.
    fn handle(
        &mut self,
        ctx: &PhaseContext<'_>,
        action: ResultAction,
        phase: Phase,
        origin: Origin,
        end_stream: bool,
    ) -> Flow {
        match action {
            ResultAction::Continue => Flow::Next,
            ResultAction::LocalResponse(resp) => {
                let name = self.wrapper_name(origin);
                ctx.send_local_reply(resp, self.req_headers.as_ref(), self.rsp_headers.as_ref(), Some(&*name));
                self.stop_after_reply(phase);
                Flow::Stop(StreamStatus::LocalReply)
            }
            ResultAction::WaitAllData => {
                match origin {
                    Origin::Authn(_) => {
                        warn!(plugin = %self.wrapper_name(origin), "authn filters cannot wait for the whole body, ignored");
                    }
                    Origin::Chain(_) if phase == Phase::DECODE_HEADERS => self.decode_request_needed = true,
                    Origin::Chain(_) if phase == Phase::ENCODE_HEADERS => self.encode_response_needed = true,
                    Origin::Chain(_) => {
                        error!(plugin = %self.wrapper_name(origin), phase = %phase, "WaitAllData is only allowed in a headers phase, ignored");
                    }
                }
                Flow::Next
            }
            ResultAction::WaitData => {
                if matches!(origin, Origin::Chain(_)) && phase == Phase::ENCODE_HEADERS && !end_stream {
                    self.encode_wait_data_needed = true;
                } else {
                    error!(plugin = %self.wrapper_name(origin), phase = %phase, end_stream, "WaitData is only allowed in EncodeHeaders before the end of stream, ignored");
                }
                Flow::Next
            }
        }
    }

    /// After a local reply the rest of that direction answers `LocalReply`
    /// without running filters.
    fn stop_after_reply(&mut self, phase: Phase) {
        if DECODE_WHOLE.contains(phase) {
            self.decode_stopped = true;
        } else if ENCODE_WHOLE.contains(phase) {
            self.encode_stopped = true;
        }
    }

    fn reply_500(&mut self, ctx: &PhaseContext<'_>, headers: &RequestHeaderMap) -> StreamStatus {
        ctx.send_local_reply(LocalResponse::new(500), Some(headers), None, None);
        self.decode_stopped = true;
        StreamStatus::LocalReply
    }

    /// Answer a phase whose filter panicked.
    pub(crate) fn recover_from_panic(&mut self, ctx: &PhaseContext<'_>, phase: Phase) -> StreamStatus {
        self.stop_after_reply(phase);
        ctx.send_local_reply(
            LocalResponse::new(500),
            self.req_headers.as_ref(),
            self.rsp_headers.as_ref(),
            None,
        );
        StreamStatus::LocalReply
    }

    // ---------------------------------------------------------------- decode

    pub(crate) fn decode_headers(
        &mut self,
        ctx: &PhaseContext<'_>,
        headers: RequestHeaderMap,
        end_stream: bool,
    ) -> Step {
        self.store_request_headers(&headers);
        if self.broken {
            return Step::Done(self.reply_500(ctx, &headers));
        }
        if let Some(failure) = ctx.config.ensure_init() {
            ctx.callbacks.set_metadata(
                METADATA_NAMESPACE,
                INIT_FAILED_PLUGIN_KEY,
                serde_json::Value::String(failure.plugin.clone()),
            );
            return Step::Done(self.reply_500(ctx, &headers));
        }

        for i in 0..self.authn.len() {
            let action = self.authn[i].filter.decode_headers(&headers, end_stream);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::DECODE_HEADERS, Origin::Authn(i), end_stream)
            {
                return Step::Done(status);
            }
        }

        if !self.authn.is_empty() {
            let Some(consumer) = ctx.callbacks.consumer() else {
                ctx.send_local_reply(
                    LocalResponse::new(401).with_msg("consumer not found"),
                    Some(&headers),
                    None,
                    None,
                );
                self.decode_stopped = true;
                return Step::Done(StreamStatus::LocalReply);
            };
            tracing::Span::current().record("consumer", consumer.name());

            if consumer.has_filters() && !self.consumer_merged {
                if ctx.inline && consumer.init_pending() {
                    debug!(consumer = %consumer.name(), "consumer filters need init, continuing in the background");
                    return Step::Continue(Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                        state.merge_consumer(ctx, &consumer);
                        Step::Done(state.decode_headers_chain(ctx, &headers, end_stream))
                    }));
                }
                self.merge_consumer(ctx, &consumer);
                if ctx.inline && !self.capabilities.can_sync_run(decode_headers_mask(end_stream)) {
                    debug!(consumer = %consumer.name(), "consumer filters may block, continuing in the background");
                    return Step::Continue(Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                        Step::Done(state.decode_headers_chain(ctx, &headers, end_stream))
                    }));
                }
            }
        }

        Step::Done(self.decode_headers_chain(ctx, &headers, end_stream))
    }

    fn decode_headers_chain(
        &mut self,
        ctx: &PhaseContext<'_>,
        headers: &RequestHeaderMap,
        end_stream: bool,
    ) -> StreamStatus {
        for i in 0..self.filters.len() {
            let action = self.filters[i].filter.decode_headers(headers, end_stream);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::DECODE_HEADERS, Origin::Chain(i), end_stream)
            {
                return status;
            }
            if std::mem::take(&mut self.decode_request_needed) {
                self.decode_idx = Some(i);
                if end_stream {
                    return self.decode_whole_request(ctx, None, None);
                }
                return StreamStatus::StopAndBuffer;
            }
        }
        StreamStatus::Continue
    }

    pub(crate) fn decode_data(&mut self, ctx: &PhaseContext<'_>, data: Buffer, end_stream: bool) -> Step {
        if self.decode_stopped {
            return Step::Done(StreamStatus::LocalReply);
        }
        if self.decode_idx.is_some() {
            // The newest chunk carries everything received so far.
            if let Some(prev) = self.req_body.replace(data.clone()) {
                if !prev.ptr_eq(&data) {
                    data.prepend(prev.take());
                }
            }
            if !end_stream {
                return Step::Done(StreamStatus::StopAndBuffer);
            }
            return Step::Done(self.decode_whole_request(ctx, Some(data), None));
        }

        for i in 0..self.filters.len() {
            let action = self.filters[i].filter.decode_data(&data, end_stream);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::DECODE_DATA, Origin::Chain(i), end_stream)
            {
                return Step::Done(status);
            }
        }
        Step::Done(StreamStatus::Continue)
    }

    pub(crate) fn decode_trailers(&mut self, ctx: &PhaseContext<'_>, trailers: RequestTrailerMap) -> Step {
        if self.decode_stopped {
            return Step::Done(StreamStatus::LocalReply);
        }
        self.store_request_trailers(&trailers);
        if self.decode_idx.is_some() {
            let body = self.req_body.clone();
            return Step::Done(self.decode_whole_request(ctx, body, Some(trailers)));
        }

        for i in 0..self.filters.len() {
            let action = self.filters[i].filter.decode_trailers(&trailers);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::DECODE_TRAILERS, Origin::Chain(i), true)
            {
                return Step::Done(status);
            }
        }
        Step::Done(StreamStatus::Continue)
    }

    fn decode_whole_request(
        &mut self,
        ctx: &PhaseContext<'_>,
        body: Option<Buffer>,
        trailers: Option<RequestTrailerMap>,
    ) -> StreamStatus {
        let Some(mut cursor) = self.decode_idx else {
            return StreamStatus::Continue;
        };
        let headers = self.req_headers.clone().unwrap_or_default();
        let headers_end = body.is_none() && trailers.is_none();

        if let Some(status) = self.replay_decode(ctx, 0..cursor, body.as_ref(), trailers.as_ref()) {
            return status;
        }

        loop {
            let action = self.filters[cursor].filter.decode_request(&headers, body.as_ref(), trailers.as_ref());
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::DECODE_REQUEST, Origin::Chain(cursor), true)
            {
                return status;
            }

            let mut next = None;
            for i in cursor + 1..self.filters.len() {
                let action = self.filters[i].filter.decode_headers(&headers, headers_end);
                if let Flow::Stop(status) =
                    self.handle(ctx, action, Phase::DECODE_HEADERS, Origin::Chain(i), headers_end)
                {
                    return status;
                }
                if std::mem::take(&mut self.decode_request_needed) {
                    next = Some(i);
                    break;
                }
            }

            let end = next.unwrap_or(self.filters.len());
            if let Some(status) = self.replay_decode(ctx, cursor + 1..end, body.as_ref(), trailers.as_ref()) {
                return status;
            }
            match next {
                Some(i) => {
                    cursor = i;
                    self.decode_idx = Some(i);
                }
                None => return StreamStatus::Continue,
            }
        }
    }

    /// Stream the buffered body and trailers through `range`, one call each.
    fn replay_decode(
        &mut self,
        ctx: &PhaseContext<'_>,
        range: Range<usize>,
        body: Option<&Buffer>,
        trailers: Option<&RequestTrailerMap>,
    ) -> Option<StreamStatus> {
        if let Some(body) = body {
            for i in range.clone() {
                let action = self.filters[i].filter.decode_data(body, trailers.is_none());
                if let Flow::Stop(status) =
                    self.handle(ctx, action, Phase::DECODE_DATA, Origin::Chain(i), trailers.is_none())
                {
                    return Some(status);
                }
            }
        }
        if let Some(trailers) = trailers {
            for i in range {
                let action = self.filters[i].filter.decode_trailers(trailers);
                if let Flow::Stop(status) =
                    self.handle(ctx, action, Phase::DECODE_TRAILERS, Origin::Chain(i), true)
                {
                    return Some(status);
                }
            }
        }
        None
    }

    /// Splice a consumer's own filters into the chain.
    fn merge_consumer(&mut self, ctx: &PhaseContext<'_>, consumer: &Consumer) {
        let plan = consumer.chain_plan();
        let names: HashSet<&str> = plan.filters.iter().map(|fc| fc.name.as_str()).collect();
        self.filters.retain(|w| !names.contains(&*w.name));
        for fc in &plan.filters {
            let wrapper = ctx.build_filter(fc, self.decoration);
            self.filters.push(wrapper);
        }
        let registry = ctx.config.registry();
        self.filters.sort_by(|a, b| registry.compare_order(&a.name, &b.name));
        self.capabilities = self.capabilities.merge(plan.capabilities);
        self.consumer_merged = true;
        debug!(
            consumer = %consumer.name(),
            filters = ?self.filters.iter().map(|w| &*w.name).collect::<Vec<_>>(),
            "merged consumer filters"
        );
    }

    // ---------------------------------------------------------------- encode

    pub(crate) fn encode_headers(
        &mut self,
        ctx: &PhaseContext<'_>,
        headers: ResponseHeaderMap,
        end_stream: bool,
    ) -> Step {
        self.store_response_headers(&headers);
        if self.encode_stopped {
            return Step::Done(StreamStatus::LocalReply);
        }
        for i in (0..self.filters.len()).rev() {
            let action = self.filters[i].filter.encode_headers(&headers, end_stream);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::ENCODE_HEADERS, Origin::Chain(i), end_stream)
            {
                return Step::Done(status);
            }
            if std::mem::take(&mut self.encode_response_needed) {
                self.encode_wait_data_needed = false;
                self.encode_idx = Some(i);
                if end_stream {
                    return Step::Done(self.encode_whole_response(ctx, None, None));
                }
                return Step::Done(StreamStatus::StopAndBuffer);
            }
            if std::mem::take(&mut self.encode_wait_data_needed) {
                self.encode_wait_idx = Some(i);
                return Step::Done(StreamStatus::StopNoBuffer);
            }
        }
        Step::Done(StreamStatus::Continue)
    }

    pub(crate) fn encode_data(&mut self, ctx: &PhaseContext<'_>, data: Buffer, end_stream: bool) -> Step {
        if self.encode_stopped {
            return Step::Done(StreamStatus::LocalReply);
        }
        let n = self.filters.len();
        if let Some(w) = self.encode_wait_idx.take() {
            for i in (w..n).rev() {
                if let Some(status) = self.encode_data_at(ctx, i, &data, end_stream) {
                    return Step::Done(status);
                }
            }
            if let Some(status) = self.resume_encode_headers(ctx, w) {
                return Step::Done(status);
            }
            for i in (0..w).rev() {
                if let Some(status) = self.encode_data_at(ctx, i, &data, end_stream) {
                    return Step::Done(status);
                }
            }
            return Step::Done(StreamStatus::Continue);
        }

        if self.encode_idx.is_some() {
            if let Some(prev) = self.rsp_body.replace(data.clone()) {
                if !prev.ptr_eq(&data) {
                    data.prepend(prev.take());
                }
            }
            if !end_stream {
                return Step::Done(StreamStatus::StopAndBuffer);
            }
            return Step::Done(self.encode_whole_response(ctx, Some(data), None));
        }

        for i in (0..n).rev() {
            if let Some(status) = self.encode_data_at(ctx, i, &data, end_stream) {
                return Step::Done(status);
            }
        }
        Step::Done(StreamStatus::Continue)
    }

    fn encode_data_at(
        &mut self,
        ctx: &PhaseContext<'_>,
        i: usize,
        data: &Buffer,
        end_stream: bool,
    ) -> Option<StreamStatus> {
        let action = self.filters[i].filter.encode_data(data, end_stream);
        match self.handle(ctx, action, Phase::ENCODE_DATA, Origin::Chain(i), end_stream) {
            Flow::Stop(status) => Some(status),
            Flow::Next => None,
        }
    }

    /// Deliver the held response headers to the filters in front of `w`.
    fn resume_encode_headers(&mut self, ctx: &PhaseContext<'_>, w: usize) -> Option<StreamStatus> {
        let headers = self.rsp_headers.clone().unwrap_or_default();
        for i in (0..w).rev() {
            let action = self.filters[i].filter.encode_headers(&headers, false);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::ENCODE_HEADERS, Origin::Chain(i), false)
            {
                return Some(status);
            }
            let whole = std::mem::take(&mut self.encode_response_needed);
            let wait = std::mem::take(&mut self.encode_wait_data_needed);
            if whole || wait {
                warn!(plugin = %self.filters[i].name, "cannot wait for response data after WaitData, ignored");
            }
        }
        None
    }

    pub(crate) fn encode_trailers(&mut self, ctx: &PhaseContext<'_>, trailers: ResponseTrailerMap) -> Step {
        self.store_response_trailers(&trailers);
        if self.encode_stopped {
            return Step::Done(StreamStatus::LocalReply);
        }
        if let Some(w) = self.encode_wait_idx.take() {
            if let Some(status) = self.resume_encode_headers(ctx, w) {
                return Step::Done(status);
            }
        } else if self.encode_idx.is_some() {
            let body = self.rsp_body.clone();
            return Step::Done(self.encode_whole_response(ctx, body, Some(trailers)));
        }

        for i in (0..self.filters.len()).rev() {
            let action = self.filters[i].filter.encode_trailers(&trailers);
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::ENCODE_TRAILERS, Origin::Chain(i), true)
            {
                return Step::Done(status);
            }
        }
        Step::Done(StreamStatus::Continue)
    }

    fn encode_whole_response(
        &mut self,
        ctx: &PhaseContext<'_>,
        body: Option<Buffer>,
        trailers: Option<ResponseTrailerMap>,
    ) -> StreamStatus {
        let Some(mut cursor) = self.encode_idx else {
            return StreamStatus::Continue;
        };
        let headers = self.rsp_headers.clone().unwrap_or_default();
        let headers_end = body.is_none() && trailers.is_none();

        let n = self.filters.len();
        if let Some(status) = self.replay_encode(ctx, cursor + 1..n, body.as_ref(), trailers.as_ref()) {
            return status;
        }

        loop {
            let action = self.filters[cursor].filter.encode_response(&headers, body.as_ref(), trailers.as_ref());
            if let Flow::Stop(status) =
                self.handle(ctx, action, Phase::ENCODE_RESPONSE, Origin::Chain(cursor), true)
            {
                return status;
            }

            let mut next = None;
            for i in (0..cursor).rev() {
                let action = self.filters[i].filter.encode_headers(&headers, headers_end);
                if let Flow::Stop(status) =
                    self.handle(ctx, action, Phase::ENCODE_HEADERS, Origin::Chain(i), headers_end)
                {
                    return status;
                }
                if std::mem::take(&mut self.encode_wait_data_needed) {
                    warn!(plugin = %self.filters[i].name, "WaitData after a whole-response filter, ignored");
                }
                if std::mem::take(&mut self.encode_response_needed) {
                    next = Some(i);
                    break;
                }
            }

            let lo = next.map_or(0, |i| i + 1);
            if let Some(status) = self.replay_encode(ctx, lo..cursor, body.as_ref(), trailers.as_ref()) {
                return status;
            }
            match next {
                Some(i) => {
                    cursor = i;
                    self.encode_idx = Some(i);
                }
                None => return StreamStatus::Continue,
            }
        }
    }

    /// Stream the buffered response through `range`, in encode order.
    fn replay_encode(
        &mut self,
        ctx: &PhaseContext<'_>,
        range: Range<usize>,
        body: Option<&Buffer>,
        trailers: Option<&ResponseTrailerMap>,
    ) -> Option<StreamStatus> {
        if let Some(body) = body {
            for i in range.clone().rev() {
                if let Some(status) = self.encode_data_at(ctx, i, body, trailers.is_none()) {
                    return Some(status);
                }
            }
        }
        if let Some(trailers) = trailers {
            for i in range.rev() {
                let action = self.filters[i].filter.encode_trailers(trailers);
                if let Flow::Stop(status) =
                    self.handle(ctx, action, Phase::ENCODE_TRAILERS, Origin::Chain(i), true)
                {
                    return Some(status);
                }
            }
        }
        None
    }

    // ---------------------------------------------------------------- log

    /// Run `OnLog` on every filter, authn filters first. Missing maps fall
    /// back to the ones seen during the stream.
    pub(crate) fn on_log(
        &mut self,
        req_headers: Option<RequestHeaderMap>,
        req_trailers: Option<RequestTrailerMap>,
        rsp_headers: Option<ResponseHeaderMap>,
        rsp_trailers: Option<ResponseTrailerMap>,
    ) {
        let req_headers = req_headers.or_else(|| self.req_headers.clone());
        let req_trailers = req_trailers.or_else(|| self.req_trailers.clone());
        let rsp_headers = rsp_headers.or_else(|| self.rsp_headers.clone());
        let rsp_trailers = rsp_trailers.or_else(|| self.rsp_trailers.clone());
        for wrapper in self.authn.iter_mut().chain(self.filters.iter_mut()) {
            wrapper.filter.on_log(
                req_headers.as_ref(),
                req_trailers.as_ref(),
                rsp_headers.as_ref(),
                rsp_trailers.as_ref(),
            );
        }
    }
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("filters", &self.filter_names())
            .field("broken", &self.broken)
            .field("decode_idx", &self.decode_idx)
            .field("encode_idx", &self.encode_idx)
            .field("encode_wait_idx", &self.encode_wait_idx)
            .finish()
    }
}
