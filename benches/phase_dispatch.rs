use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use filterchain::api::{
    Filter, HeaderMap, HostStream, LocalReply, Phase, RequestHeaderMap, ResponseHeaderMap, ResultAction,
    StreamInfo,
};
use filterchain::consumer::ConsumerStore;
use filterchain::filtermanager::{Dispatcher, FilterConfigEntry};
use filterchain::plugins::{FilterFactory, ParsedConfig};
use filterchain::{
    FilterChainConfig, FilterManager, FilterManagerConfig, ManagerContext, Plugin, PluginRegistry, Result,
};
use std::sync::Arc;
use std::time::Duration;

struct NoopHost;

impl HostStream for NoopHost {
    fn send_local_reply(&self, _reply: LocalReply) {}

    fn stream_info(&self) -> StreamInfo {
        StreamInfo::default()
    }

    fn set_metadata(&self, _namespace: &str, _key: &str, _value: serde_json::Value) {}
}

struct HeaderTouch;

impl Filter for HeaderTouch {
    fn decode_headers(&mut self, headers: &RequestHeaderMap, _end_stream: bool) -> ResultAction {
        black_box(headers.path());
        ResultAction::Continue
    }

    fn encode_headers(&mut self, headers: &ResponseHeaderMap, _end_stream: bool) -> ResultAction {
        black_box(headers.status());
        ResultAction::Continue
    }
}

struct Bench {
    phases: Phase,
}

impl Plugin for Bench {
    fn parse_config(&self, _raw: &serde_json::Value) -> Result<ParsedConfig> {
        Ok(ParsedConfig::empty())
    }

    fn factory(&self) -> FilterFactory {
        FilterFactory::new(self.phases, |_, _| Box::new(HeaderTouch))
    }

    fn non_blocking_phases(&self) -> Phase {
        Phase::ALL
    }
}

fn context() -> ManagerContext {
    let registry = PluginRegistry::new();
    for i in 0..16 {
        registry.register(&format!("log{}", i), Bench { phases: Phase::ON_LOG }).unwrap();
        registry
            .register(
                &format!("hdr{}", i),
                Bench { phases: Phase::DECODE_HEADERS | Phase::ENCODE_HEADERS },
            )
            .unwrap();
    }
    let dispatcher = Dispatcher::background(&Default::default()).unwrap();
    ManagerContext::new(Arc::new(registry), Arc::new(ConsumerStore::new()), dispatcher)
}

fn chain(prefix: &str, count: usize) -> FilterChainConfig {
    FilterChainConfig {
        namespace: String::new(),
        plugins: (0..count)
            .map(|i| FilterConfigEntry::new(format!("{}{}", prefix, i), serde_json::Value::Null))
            .collect(),
    }
}

fn bench_stream(c: &mut Criterion) {
    let ctx = context();
    let host: Arc<dyn HostStream> = Arc::new(NoopHost);

    let mut group = c.benchmark_group("phase_dispatch");
    group.measurement_time(Duration::from_secs(5));

    for count in [1usize, 4, 16].iter() {
        for (label, prefix) in [("skipped", "log"), ("inline", "hdr")] {
            let config = FilterManagerConfig::compile(&ctx, &chain(prefix, *count));
            group.bench_with_input(BenchmarkId::new(label, count), count, |b, _| {
                b.iter(|| {
                    let stream = FilterManager::new(&config, Arc::clone(&host));
                    let request: RequestHeaderMap =
                        HeaderMap::from_iter([(":method", "GET"), (":path", "/bench")]).into();
                    let response: ResponseHeaderMap = HeaderMap::from_iter([(":status", "200")]).into();
                    black_box(stream.decode_headers(request, true).wait());
                    black_box(stream.encode_headers(response, true).wait());
                    stream.on_log(None, None, None, None).wait()
                });
            });
        }
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let ctx = context();
    let parent = FilterManagerConfig::compile(&ctx, &chain("hdr", 16));
    let child = FilterManagerConfig::compile(&ctx, &chain("log", 4));

    let mut group = c.benchmark_group("config");
    group.bench_function("compile_16", |b| {
        b.iter(|| FilterManagerConfig::compile(&ctx, black_box(&chain("hdr", 16))))
    });
    group.bench_function("merge_16_4", |b| b.iter(|| FilterManagerConfig::merge(&parent, &child)));
    group.finish();
}

criterion_group!(benches, bench_stream, bench_compile);
criterion_main!(benches);
