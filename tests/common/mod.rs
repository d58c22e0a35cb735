//! Common test utilities for all integration tests.
//!
//! Provides a recording host, scriptable filters and plugin registry setup.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use filterchain::api::{
    Buffer, Filter, FilterCallbackHandler, HeaderMap, HostStream, LocalReply, Phase,
    RequestHeaderMap, RequestTrailerMap, ResponseHeaderMap, ResponseTrailerMap, ResultAction,
    StreamInfo,
};
use filterchain::consumer::{Consumer, ConsumerStore};
use filterchain::filtermanager::Dispatcher;
use filterchain::plugins::{
    parse_consumer_json, ConsumerPlugin, FilterFactory, OrderPosition, ParsedConfig,
    PluginConsumerConfig, PluginOrder,
};
use filterchain::{ManagerContext, Plugin, PluginRegistry, Result};
use serde::Deserialize;

/// Ordered log of every filter call, shared by all filters of a test.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries of one filter, without the name prefix.
    pub fn of(&self, name: &str) -> Vec<String> {
        let prefix = format!("{}:", name);
        self.entries().into_iter().filter_map(|e| e.strip_prefix(&prefix).map(str::to_string)).collect()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// A one-way latch a filter can block on.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// What a [`ScriptFilter`] does besides journaling its calls.
#[derive(Clone, Default)]
pub struct Script {
    pub actions: HashMap<Phase, ResultAction>,
    pub panics: Phase,
    pub blocks_on: Option<Gate>,
    /// Record the thread each call ran on.
    pub record_thread: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, phase: Phase, action: ResultAction) -> Self {
        self.actions.insert(phase, action);
        self
    }

    pub fn panics_in(mut self, phase: Phase) -> Self {
        self.panics |= phase;
        self
    }

    pub fn blocks_on(mut self, gate: Gate) -> Self {
        self.blocks_on = Some(gate);
        self
    }

    pub fn record_thread(mut self) -> Self {
        self.record_thread = true;
        self
    }
}

pub struct ScriptFilter {
    name: String,
    script: Script,
    journal: Journal,
}

impl ScriptFilter {
    fn call(&mut self, phase: Phase, detail: String) -> ResultAction {
        let method = phase.name().unwrap_or("?");
        let mut entry = format!("{}:{}{}", self.name, method, detail);
        if self.script.record_thread {
            let thread = std::thread::current().name().unwrap_or("").to_string();
            entry = format!("{}@{}", entry, thread);
        }
        self.journal.push(entry);
        if let Some(gate) = &self.script.blocks_on {
            gate.wait();
        }
        if self.script.panics.contains(phase) {
            panic!("{} exploded in {}", self.name, method);
        }
        self.script.actions.get(&phase).cloned().unwrap_or_default()
    }
}

fn body(data: Option<&Buffer>) -> String {
    data.map_or_else(|| "-".to_string(), Buffer::to_string_lossy)
}

impl Filter for ScriptFilter {
    fn decode_headers(&mut self, _headers: &RequestHeaderMap, end_stream: bool) -> ResultAction {
        self.call(Phase::DECODE_HEADERS, format!("({})", end_stream))
    }

    fn decode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.call(Phase::DECODE_DATA, format!("({},{})", data.to_string_lossy(), end_stream))
    }

    fn decode_trailers(&mut self, _trailers: &RequestTrailerMap) -> ResultAction {
        self.call(Phase::DECODE_TRAILERS, String::new())
    }

    fn decode_request(
        &mut self,
        _headers: &RequestHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&RequestTrailerMap>,
    ) -> ResultAction {
        self.call(Phase::DECODE_REQUEST, format!("({},{})", body(data), trailers.is_some()))
    }

    fn encode_headers(&mut self, _headers: &ResponseHeaderMap, end_stream: bool) -> ResultAction {
        self.call(Phase::ENCODE_HEADERS, format!("({})", end_stream))
    }

    fn encode_data(&mut self, data: &Buffer, end_stream: bool) -> ResultAction {
        self.call(Phase::ENCODE_DATA, format!("({},{})", data.to_string_lossy(), end_stream))
    }

    fn encode_trailers(&mut self, _trailers: &ResponseTrailerMap) -> ResultAction {
        self.call(Phase::ENCODE_TRAILERS, String::new())
    }

    fn encode_response(
        &mut self,
        _headers: &ResponseHeaderMap,
        data: Option<&Buffer>,
        trailers: Option<&ResponseTrailerMap>,
    ) -> ResultAction {
        self.call(Phase::ENCODE_RESPONSE, format!("({},{})", body(data), trailers.is_some()))
    }

    fn on_log(
        &mut self,
        _req_headers: Option<&RequestHeaderMap>,
        _req_trailers: Option<&RequestTrailerMap>,
        _resp_headers: Option<&ResponseHeaderMap>,
        _resp_trailers: Option<&ResponseTrailerMap>,
    ) {
        self.call(Phase::ON_LOG, String::new());
    }
}

/// A plugin building [`ScriptFilter`]s.
pub struct ScriptPlugin {
    pub name: String,
    pub position: OrderPosition,
    pub phases: Phase,
    pub non_blocking: Phase,
    pub script: Script,
    pub journal: Journal,
}

impl ScriptPlugin {
    pub fn new(name: &str, position: OrderPosition, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            position,
            phases: Phase::ALL,
            non_blocking: Phase::ALL,
            script: Script::default(),
            journal: journal.clone(),
        }
    }

    pub fn phases(mut self, phases: Phase) -> Self {
        self.phases = phases;
        self
    }

    pub fn blocking(mut self, phases: Phase) -> Self {
        self.non_blocking = Phase::ALL & !phases;
        self
    }

    pub fn script(mut self, script: Script) -> Self {
        self.script = script;
        self
    }
}

impl Plugin for ScriptPlugin {
    fn order(&self) -> PluginOrder {
        PluginOrder::new(self.position)
    }

    fn parse_config(&self, _raw: &serde_json::Value) -> Result<ParsedConfig> {
        Ok(ParsedConfig::empty())
    }

    fn factory(&self) -> FilterFactory {
        let name = self.name.clone();
        let script = self.script.clone();
        let journal = self.journal.clone();
        FilterFactory::new(self.phases, move |_, _| {
            Box::new(ScriptFilter { name: name.clone(), script: script.clone(), journal: journal.clone() })
        })
    }

    fn non_blocking_phases(&self) -> Phase {
        self.non_blocking
    }
}

#[derive(Debug, Deserialize)]
pub struct Credential {
    pub key: String,
}

impl PluginConsumerConfig for Credential {
    fn index(&self) -> String {
        self.key.clone()
    }
}

/// An authn filter that identifies the consumer from one request header.
pub struct HeaderAuthFilter {
    plugin: String,
    header: String,
    callbacks: Arc<dyn FilterCallbackHandler>,
    journal: Journal,
}

impl Filter for HeaderAuthFilter {
    fn decode_headers(&mut self, headers: &RequestHeaderMap, _end_stream: bool) -> ResultAction {
        self.journal.push(format!("{}:DecodeHeaders", self.plugin));
        if let Some(key) = headers.get(&self.header) {
            if let Some(consumer) = self.callbacks.lookup_consumer(&self.plugin, &key) {
                self.callbacks.set_consumer(consumer);
            }
        }
        ResultAction::Continue
    }
}

pub struct HeaderAuthPlugin {
    pub name: String,
    pub header: String,
    pub journal: Journal,
}

impl HeaderAuthPlugin {
    pub fn new(name: &str, header: &str, journal: &Journal) -> Self {
        Self { name: name.to_string(), header: header.to_string(), journal: journal.clone() }
    }
}

impl Plugin for HeaderAuthPlugin {
    fn order(&self) -> PluginOrder {
        PluginOrder::new(OrderPosition::Authn)
    }

    fn parse_config(&self, _raw: &serde_json::Value) -> Result<ParsedConfig> {
        Ok(ParsedConfig::empty())
    }

    fn factory(&self) -> FilterFactory {
        let plugin = self.name.clone();
        let header = self.header.clone();
        let journal = self.journal.clone();
        FilterFactory::new(Phase::DECODE_HEADERS, move |_, callbacks| {
            Box::new(HeaderAuthFilter {
                plugin: plugin.clone(),
                header: header.clone(),
                callbacks,
                journal: journal.clone(),
            })
        })
    }

    fn non_blocking_phases(&self) -> Phase {
        Phase::ALL
    }

    fn as_consumer(&self) -> Option<&dyn ConsumerPlugin> {
        Some(self)
    }
}

impl ConsumerPlugin for HeaderAuthPlugin {
    fn parse_consumer_config(&self, raw: &serde_json::Value) -> Result<Arc<dyn PluginConsumerConfig>> {
        parse_consumer_json::<Credential>(raw)
    }
}

/// Records what the manager asks of the host.
#[derive(Default)]
pub struct RecordingHost {
    pub replies: Mutex<Vec<LocalReply>>,
    pub metadata: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replies(&self) -> Vec<LocalReply> {
        self.replies.lock().unwrap().clone()
    }

    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.metadata.lock().unwrap().iter().find(|(_, k, _)| k == key).map(|(_, _, v)| v.clone())
    }
}

impl HostStream for RecordingHost {
    fn send_local_reply(&self, reply: LocalReply) {
        self.replies.lock().unwrap().push(reply);
    }

    fn stream_info(&self) -> StreamInfo {
        StreamInfo { route_name: "test-route".to_string(), ..Default::default() }
    }

    fn set_metadata(&self, namespace: &str, key: &str, value: serde_json::Value) {
        self.metadata.lock().unwrap().push((namespace.to_string(), key.to_string(), value));
    }
}

/// A context over `registry` with a fresh consumer store.
pub fn context(registry: PluginRegistry) -> (ManagerContext, Arc<ConsumerStore>) {
    let consumers = Arc::new(ConsumerStore::new());
    let dispatcher = Dispatcher::background(&Default::default()).expect("background runtime");
    let ctx = ManagerContext::new(Arc::new(registry), consumers.clone(), dispatcher);
    (ctx, consumers)
}

pub fn add_consumer(
    ctx: &ManagerContext,
    store: &ConsumerStore,
    namespace: &str,
    name: &str,
    spec: serde_json::Value,
) -> Arc<Consumer> {
    let consumer = Consumer::from_json(namespace, name, &spec, ctx.plugins()).expect("valid consumer");
    store.insert(consumer)
}

pub fn request(headers: &[(&str, &str)]) -> RequestHeaderMap {
    let mut all = vec![(":method", "GET"), (":path", "/"), (":authority", "example.com")];
    all.extend_from_slice(headers);
    HeaderMap::from_iter(all).into()
}

pub fn response(status: &str) -> ResponseHeaderMap {
    HeaderMap::from_iter([(":status", status)]).into()
}

pub fn trailers() -> HeaderMap {
    HeaderMap::from_iter([("grpc-status", "0")])
}
