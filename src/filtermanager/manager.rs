//! The per-stream [`FilterManager`].
//!
//! Each phase call is planned first: skipped when no filter in the chain
//! does anything in it, run on the caller's thread when every filter that
//! does has declared the phase non-blocking, and handed to the background
//! runtime otherwise. Background phases hold a reference to the stream, so
//! the stream's state only returns to the config's pool once `OnLog` has
//! run and no background phase is left.

use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, error, trace, Level, Span};

use super::callbacks::StreamCallbacks;
use super::config::FilterManagerConfig;
use super::dispatch::Completion;
use super::state::{Decoration, Dispatch, PhaseContext, Step, StreamState, Work};
use super::{PhaseStatus, StreamStatus};
use crate::api::{
    Buffer, ExecutionRecord, FilterCallbackHandler, HostStream, Phase, RequestHeaderMap,
    RequestTrailerMap, ResponseHeaderMap, ResponseTrailerMap,
};
use crate::errors::panic_message;
use crate::{phase_span, stream_span};

/// Drives one stream through a compiled filter chain.
pub struct FilterManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<FilterManagerConfig>,
    callbacks: Arc<StreamCallbacks>,
    state: Mutex<StreamState>,
    lifecycle: Mutex<Lifecycle>,
    span: Span,
}

#[derive(Default)]
struct Lifecycle {
    /// Background phases in flight.
    running: usize,
    deferred_log: Option<(LogArgs, oneshot::Sender<StreamStatus>)>,
}

struct LogArgs {
    req_headers: Option<RequestHeaderMap>,
    req_trailers: Option<RequestTrailerMap>,
    rsp_headers: Option<ResponseHeaderMap>,
    rsp_trailers: Option<ResponseTrailerMap>,
}

impl FilterManager {
    /// Start a stream on `config`.
    ///
    /// A panic while instantiating the chain leaves a manager that answers
    /// every request with a 500.
    pub fn new(config: &Arc<FilterManagerConfig>, host: Arc<dyn HostStream>) -> Self {
        let callbacks = Arc::new(StreamCallbacks::new(
            host,
            config.namespace(),
            Arc::clone(config.context().consumers()),
        ));
        let info = callbacks.stream_info();
        let span = stream_span!(info.route_name, namespace = %config.namespace());

        let mut state = config.pool.acquire();
        {
            let _entered = span.enter();
            let decoration = Decoration {
                debug: config.debug_mode(),
                log: tracing::enabled!(Level::DEBUG),
            };
            let ctx = PhaseContext { config: config.as_ref(), callbacks: &callbacks, inline: true };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| state.populate(&ctx, decoration))) {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "failed to build the filter chain for stream"
                );
                state.mark_broken();
            }
            trace!(filters = ?state.filter_names(), "stream started");
        }

        Self {
            inner: Arc::new(Inner {
                config: Arc::clone(config),
                callbacks,
                state: Mutex::new(state),
                lifecycle: Mutex::new(Lifecycle::default()),
                span,
            }),
        }
    }

    pub fn config(&self) -> &Arc<FilterManagerConfig> {
        &self.inner.config
    }

    /// The callback handler the stream's filters were built with.
    pub fn callbacks(&self) -> Arc<dyn FilterCallbackHandler> {
        Arc::clone(&self.inner.callbacks) as _
    }

    /// Names of the stream's filters in chain order, authn filters first.
    pub fn filter_names(&self) -> Vec<String> {
        self.inner.lock_state().filter_names()
    }

    pub fn execution_records(&self) -> Vec<ExecutionRecord> {
        self.inner.callbacks.execution_records()
    }

    /// Background phases currently running for this stream.
    pub fn in_flight(&self) -> usize {
        self.inner.lifecycle().running
    }

    pub fn decode_headers(&self, headers: RequestHeaderMap, end_stream: bool) -> PhaseStatus {
        let plan = {
            let mut state = self.inner.lock_state();
            let plan = state.plan_decode_headers(&self.inner.config, end_stream);
            if plan == Dispatch::Skip {
                state.store_request_headers(&headers);
            }
            plan
        };
        self.run(
            Phase::DECODE_HEADERS,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.decode_headers(ctx, headers, end_stream)
            }),
        )
    }

    pub fn decode_data(&self, data: Buffer, end_stream: bool) -> PhaseStatus {
        let plan = self.inner.lock_state().plan_decode_data(end_stream);
        self.run(
            Phase::DECODE_DATA,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.decode_data(ctx, data, end_stream)
            }),
        )
    }

    pub fn decode_trailers(&self, trailers: RequestTrailerMap) -> PhaseStatus {
        let plan = {
            let mut state = self.inner.lock_state();
            let plan = state.plan_decode_trailers();
            if plan == Dispatch::Skip {
                state.store_request_trailers(&trailers);
            }
            plan
        };
        self.run(
            Phase::DECODE_TRAILERS,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.decode_trailers(ctx, trailers)
            }),
        )
    }

    pub fn encode_headers(&self, headers: ResponseHeaderMap, end_stream: bool) -> PhaseStatus {
        let plan = {
            let mut state = self.inner.lock_state();
            let plan = state.plan_encode_headers(end_stream);
            if plan == Dispatch::Skip {
                state.store_response_headers(&headers);
            }
            plan
        };
        self.run(
            Phase::ENCODE_HEADERS,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.encode_headers(ctx, headers, end_stream)
            }),
        )
    }

    pub fn encode_data(&self, data: Buffer, end_stream: bool) -> PhaseStatus {
        let plan = self.inner.lock_state().plan_encode_data(end_stream);
        self.run(
            Phase::ENCODE_DATA,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.encode_data(ctx, data, end_stream)
            }),
        )
    }

    pub fn encode_trailers(&self, trailers: ResponseTrailerMap) -> PhaseStatus {
        let plan = {
            let mut state = self.inner.lock_state();
            let plan = state.plan_encode_trailers();
            if plan == Dispatch::Skip {
                state.store_response_trailers(&trailers);
            }
            plan
        };
        self.run(
            Phase::ENCODE_TRAILERS,
            plan,
            Box::new(move |state: &mut StreamState, ctx: &PhaseContext<'_>| {
                state.encode_trailers(ctx, trailers)
            }),
        )
    }

    /// The stream's final phase. Maps not given fall back to the ones seen
    /// during the stream.
    ///
    /// If a background phase is still running, `OnLog` waits for it and the
    /// returned status is pending until both have finished.
    pub fn on_log(
        self,
        req_headers: Option<RequestHeaderMap>,
        req_trailers: Option<RequestTrailerMap>,
        rsp_headers: Option<ResponseHeaderMap>,
        rsp_trailers: Option<ResponseTrailerMap>,
    ) -> PhaseStatus {
        let args = LogArgs { req_headers, req_trailers, rsp_headers, rsp_trailers };
        {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.running > 0 {
                let (tx, completion) = Completion::channel();
                lifecycle.deferred_log = Some((args, tx));
                debug!(parent: &self.inner.span, running = lifecycle.running, "deferring OnLog until background phases finish");
                return PhaseStatus::Pending(completion);
            }
        }

        let plan = self.inner.lock_state().plan_on_log();
        match plan {
            Dispatch::Skip | Dispatch::Inline => {
                self.inner.finish(args);
                PhaseStatus::Ready(StreamStatus::Continue)
            }
            Dispatch::Background => {
                let (tx, completion) = Completion::channel();
                let inner = Arc::clone(&self.inner);
                self.inner.config.context().dispatcher().spawn_blocking(move || {
                    inner.finish(args);
                    let _ = tx.send(StreamStatus::Continue);
                });
                PhaseStatus::Pending(completion)
            }
        }
    }

    fn run(&self, phase: Phase, plan: Dispatch, work: Work) -> PhaseStatus {
        match plan {
            Dispatch::Skip => {
                trace!(parent: &self.inner.span, phase = %phase, "no filter runs in phase, skipped");
                PhaseStatus::Ready(StreamStatus::Continue)
            }
            Dispatch::Inline => match self.inner.execute(phase, true, work) {
                Step::Done(status) => PhaseStatus::Ready(status),
                Step::Continue(rest) => self.spawn(phase, rest),
            },
            Dispatch::Background => self.spawn(phase, work),
        }
    }

    fn spawn(&self, phase: Phase, work: Work) -> PhaseStatus {
        self.inner.lifecycle().running += 1;
        let (tx, completion) = Completion::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.config.context().dispatcher().spawn_blocking(move || {
            let _done = BackgroundGuard(Arc::clone(&inner));
            let mut step = inner.execute(phase, false, work);
            let status = loop {
                match step {
                    Step::Done(status) => break status,
                    Step::Continue(rest) => step = inner.execute(phase, false, rest),
                }
            };
            if tx.send(status).is_err() {
                debug!(parent: &inner.span, phase = %phase, "nobody is waiting for the phase result");
            }
        });
        PhaseStatus::Pending(completion)
    }
}

impl std::fmt::Debug for FilterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterManager")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one unit of phase work; a panic becomes a 500 local reply.
    fn execute(&self, phase: Phase, inline: bool, work: Work) -> Step {
        let _stream = self.span.enter();
        let _phase = phase_span!(phase, inline).entered();
        let mut state = self.lock_state();
        let ctx = PhaseContext { config: self.config.as_ref(), callbacks: &self.callbacks, inline };
        match catch_unwind(AssertUnwindSafe(|| work(&mut *state, &ctx))) {
            Ok(step) => step,
            Err(payload) => {
                error!(
                    phase = %phase,
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "panic while running filter chain"
                );
                Step::Done(state.recover_from_panic(&ctx, phase))
            }
        }
    }

    /// A background phase ended; run a deferred `OnLog` if it was the last.
    fn background_done(&self) {
        let deferred = {
            let mut lifecycle = self.lifecycle();
            lifecycle.running = lifecycle.running.saturating_sub(1);
            if lifecycle.running == 0 {
                lifecycle.deferred_log.take()
            } else {
                None
            }
        };
        if let Some((args, tx)) = deferred {
            self.finish(args);
            let _ = tx.send(StreamStatus::Continue);
        }
    }

    /// Run `OnLog`, then hand the reset state back to the pool.
    fn finish(&self, args: LogArgs) {
        let _stream = self.span.enter();
        let mut state = self.lock_state();
        if state.plan_on_log() != Dispatch::Skip {
            let _phase = phase_span!(Phase::ON_LOG).entered();
            let res = catch_unwind(AssertUnwindSafe(|| {
                state.on_log(args.req_headers, args.req_trailers, args.rsp_headers, args.rsp_trailers)
            }));
            if let Err(payload) = res {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "panic while running OnLog"
                );
            }
        }
        let state = std::mem::take(&mut *state);
        self.config.pool.release(state);
        trace!(idle = self.config.pool.idle(), "stream state recycled");
    }
}

/// Marks a background phase finished even if the job unwinds.
struct BackgroundGuard(Arc<Inner>);

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        self.0.background_done();
    }
}
