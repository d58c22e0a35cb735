//! # Filter Decorators
//!
//! Two filter-shaped wrappers the manager puts around plugin filters:
//!
//! - [`LogExecutionFilter`] writes a debug line before and after each call.
//! - [`DebugFilter`] times each call and accumulates the elapsed time per
//!   plugin and phase into the stream's [`ExecutionRecorder`].
//!
//! Both return exactly what the wrapped filter returned.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::api::{
    Buffer, ExecutionRecord, Filter, Phase, RequestHeaderMap, RequestTrailerMap,
    ResponseHeaderMap, ResponseTrailerMap, ResultAction, StreamInfo,
};

/// Stream-scoped store of debug-mode timings.
#[derive(Debug, Default)]
pub struct ExecutionRecorder {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl ExecutionRecorder {
    pub fn record(&self, plugin: &str, phase: Phase, elapsed: Duration) {
        let Some(phase_name) = phase.name() else { return };
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = match records.iter().position(|r| r.plugin_name == plugin) {
            Some(idx) => idx,
            None => {
                records.push(ExecutionRecord { plugin_name: plugin.to_string(), ..Default::default() });
                records.len() - 1
            }
        };
        *records[idx].record.entry(phase_name.to_string()).or_default() += elapsed;
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Identifies a stream in execution logs: the route name, else the virtual
/// cluster, else the filter chain.
pub(crate) fn execution_id(info: &StreamInfo) -> String {
    if !info.route_name.is_empty() {
        return info.route_name.clone();
    }
    match &info.virtual_cluster_name {
        Some(vc) if !vc.is_empty() => vc.clone(),
        _ => info.filter_chain_name.clone(),
    }
}

pub struct LogExecutionFilter {
    name: Arc<str>,
    inner: Box<dyn Filter>,
    id: String,
}

impl LogExecutionFilter {
    pub fn new(name: Arc<str>, inner: Box<dyn Filter>, info: &StreamInfo) -> Self {
        Self { name, inner, id: execution_id(info) }
    }

    fn run<T>(&mut self, method: &str, call: impl FnOnce(&mut dyn Filter) -> T) -> T {
        debug!(id = %self.id, "run plugin {}, method: {}", self.name, method);
        let res = call(&mut *self.inner);
        debug!(id = %self.id, "finish running plugin {}, method: {}", self.name, method);
        res
    }
}

impl Filter for LogExecutionFilter {
    fn decode_headers(&mut self, headers: &RequestHeaderMap, end_stream: bool) -> ResultAction {
        self.run("DecodeHeaders", |f| f.decode_headers(headers, end_stream))
    }

    fn decode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.run("DecodeData", |f| f.decode_data(data, end_stream))
    }

    fn decode_trailers(&mut self, trailers: &RequestTrailerMap) -> ResultAction {
        self.run("DecodeTrailers", |f| f.decode_trailers(trailers))
    }

    fn decode_request(
        &mut self,
        headers: &RequestHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&RequestTrailerMap>,
    ) -> ResultAction {
        self.run("DecodeRequest", |f| f.decode_request(headers, data, trailers))
    }

    fn encode_headers(&mut self, headers: &ResponseHeaderMap, end_stream: bool) -> ResultAction {
        self.run("EncodeHeaders", |f| f.encode_headers(headers, end_stream))
    }

    fn encode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.run("EncodeData", |f| f.encode_data(data, end_stream))
    }

    fn encode_trailers(&mut self, trailers: &ResponseTrailerMap) -> ResultAction {
        self.run("EncodeTrailers", |f| f.encode_trailers(trailers))
    }

    fn encode_response(
        &mut self,
        headers: &ResponseHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&ResponseTrailerMap>,
    ) -> ResultAction {
        self.run("EncodeResponse", |f| f.encode_response(headers, data, trailers))
    }

    fn on_log(
        &mut self,
        req_headers: Option<&RequestHeaderMap>,
        req_trailers: Option<&RequestTrailerMap>,
        resp_headers: Option<&ResponseHeaderMap>,
        resp_trailers: Option<&ResponseTrailerMap>,
    ) {
        self.run("OnLog", |f| f.on_log(req_headers, req_trailers, resp_headers, resp_trailers))
    }
}

pub struct DebugFilter {
    name: Arc<str>,
    inner: Box<dyn Filter>,
    recorder: Arc<ExecutionRecorder>,
}

impl DebugFilter {
    pub fn new(name: Arc<str>, inner: Box<dyn Filter>, recorder: Arc<ExecutionRecorder>) -> Self {
        Self { name, inner, recorder }
    }

    fn timed(&mut self, phase: Phase, call: impl FnOnce(&mut dyn Filter) -> ResultAction) -> ResultAction {
        let started = Instant::now();
        let res = call(&mut *self.inner);
        self.recorder.record(&self.name, phase, started.elapsed());
        res
    }
}

impl Filter for DebugFilter {
    fn decode_headers(&mut self, headers: &RequestHeaderMap, end_stream: bool) -> ResultAction {
        self.timed(Phase::DECODE_HEADERS, |f| f.decode_headers(headers, end_stream))
    }

    fn decode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.timed(Phase::DECODE_DATA, |f| f.decode_data(data, end_stream))
    }

    fn decode_trailers(&mut self, trailers: &RequestTrailerMap) -> ResultAction {
        self.timed(Phase::DECODE_TRAILERS, |f| f.decode_trailers(trailers))
    }

    fn decode_request(
        &mut self,
        headers: &RequestHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&RequestTrailerMap>,
    ) -> ResultAction {
        self.timed(Phase::DECODE_REQUEST, |f| f.decode_request(headers, data, trailers))
    }

    fn encode_headers(&mut self, headers: &ResponseHeaderMap, end_stream: bool) -> ResultAction {
        self.timed(Phase::ENCODE_HEADERS, |f| f.encode_headers(headers, end_stream))
    }

    fn encode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.timed(Phase::ENCODE_DATA, |f| f.encode_data(data, end_stream))
    }

    fn encode_trailers(&mut self, trailers: &ResponseTrailerMap) -> ResultAction {
        self.timed(Phase::ENCODE_TRAILERS, |f| f.encode_trailers(trailers))
    }

    fn encode_response(
        &mut self,
        headers: &ResponseHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&ResponseTrailerMap>,
    ) -> ResultAction {
        self.timed(Phase::ENCODE_RESPONSE, |f| f.encode_response(headers, data, trailers))
    }

    // OnLog is where the records are read, so it is not timed.
    fn on_log(
        &mut self,
        req_headers: Option<&RequestHeaderMap>,
        req_trailers: Option<&RequestTrailerMap>,
        resp_headers: Option<&ResponseHeaderMap>,
        resp_trailers: Option<&ResponseTrailerMap>,
    ) {
        self.inner.on_log(req_headers, req_trailers, resp_headers, resp_trailers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LocalResponse;

    struct Slow;

    impl Filter for Slow {
        fn decode_headers(&mut self, _headers: &RequestHeaderMap, _end_stream: bool) -> ResultAction {
            std::thread::sleep(Duration::from_millis(5));
            ResultAction::LocalResponse(LocalResponse::new(429))
        }

        fn encode_headers(&mut self, _headers: &ResponseHeaderMap, _end_stream: bool) -> ResultAction {
            ResultAction::WaitData
        }
    }

    #[test]
    fn test_execution_id_fallbacks() {
        let mut info = StreamInfo { filter_chain_name: "chain".into(), ..Default::default() };
        assert_eq!(execution_id(&info), "chain");
        info.virtual_cluster_name = Some("vc".into());
        assert_eq!(execution_id(&info), "vc");
        info.route_name = "route".into();
        assert_eq!(execution_id(&info), "route");
    }

    #[test]
    fn test_debug_filter_preserves_result_and_records_time() {
        let recorder = Arc::new(ExecutionRecorder::default());
        let mut f = DebugFilter::new("slow".into(), Box::new(Slow), recorder.clone());
        let headers = RequestHeaderMap::default();

        let res = f.decode_headers(&headers, true);
        assert_eq!(res, ResultAction::LocalResponse(LocalResponse::new(429)));
        f.decode_headers(&headers, true);
        assert_eq!(f.encode_headers(&ResponseHeaderMap::default(), false), ResultAction::WaitData);
        f.on_log(None, None, None, None);

        let records = recorder.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plugin_name, "slow");
        assert!(records[0].elapsed(Phase::DECODE_HEADERS).unwrap() >= Duration::from_millis(10));
        assert!(records[0].elapsed(Phase::ENCODE_HEADERS).is_some());
        assert!(records[0].elapsed(Phase::ON_LOG).is_none());
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_log_execution_filter_logs_around_calls() {
        let info = StreamInfo { route_name: "r1".into(), ..Default::default() };
        let mut f = LogExecutionFilter::new("slow".into(), Box::new(Slow), &info);
        let res = f.encode_headers(&ResponseHeaderMap::default(), true);
        assert_eq!(res, ResultAction::WaitData);
        assert!(logs_contain("run plugin slow, method: EncodeHeaders"));
        assert!(logs_contain("finish running plugin slow, method: EncodeHeaders"));
    }
}
