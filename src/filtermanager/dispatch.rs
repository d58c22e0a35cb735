//! Background dispatch of phases that may block.
//!
//! A phase that cannot run on the host thread is handed to tokio's blocking
//! pool. The host gets a [`Completion`], a single-shot future resolving to
//! the phase's final status.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{error, info};

use super::StreamStatus;
use crate::config::DispatchConfig;
use crate::errors::{Error, Result};

static BACKGROUND: OnceCell<Runtime> = OnceCell::new();

/// Where background phases run.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    handle: Handle,
}

impl Dispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// A process-wide runtime dedicated to background phases. Built on first
    /// call; later calls reuse it and ignore `config`.
    pub fn background(config: &DispatchConfig) -> Result<Self> {
        let runtime = BACKGROUND.get_or_try_init(|| {
            let runtime = Builder::new_multi_thread()
                .worker_threads(config.worker_threads)
                .max_blocking_threads(config.max_blocking_threads)
                .thread_name(config.thread_name.clone())
                .enable_all()
                .build()
                .map_err(|e| Error::internal(format!("failed to start background runtime: {}", e)))?;
            info!(
                worker_threads = config.worker_threads,
                max_blocking_threads = config.max_blocking_threads,
                "background dispatch runtime started"
            );
            Ok::<_, Error>(runtime)
        })?;
        Ok(Self::new(runtime.handle().clone()))
    }

    pub(crate) fn spawn_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Completion is reported through the job's own channel.
        drop(self.handle.spawn_blocking(job));
    }

    /// Run `jobs` side by side on the blocking pool and wait for all of them.
    /// Results come back in input order.
    ///
    /// Blocks the calling thread, so it must not be a runtime worker.
    pub(crate) fn run_all<T, F>(&self, what: &str, jobs: Vec<F>) -> Vec<Result<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = jobs.into_iter().map(|job| self.handle.spawn_blocking(job)).collect();
        self.handle.block_on(async move {
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.await.unwrap_or_else(|e| Err(join_failure(what, e))));
            }
            results
        })
    }
}

fn join_failure(what: &str, err: JoinError) -> Error {
    if err.is_panic() {
        Error::from_panic(what, err.into_panic().as_ref())
    } else {
        Error::internal(format!("{} was cancelled", what))
    }
}

/// The pending result of a background phase.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<StreamStatus>,
}

impl Completion {
    pub(crate) fn channel() -> (oneshot::Sender<StreamStatus>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the calling thread until the phase finishes.
    ///
    /// Must not be called from inside an async context; await the
    /// completion there instead.
    pub fn wait(self) -> StreamStatus {
        self.rx.blocking_recv().unwrap_or_else(|_| abandoned())
    }

    /// The status, if the phase already finished.
    pub fn try_status(&mut self) -> Option<StreamStatus> {
        match self.rx.try_recv() {
            Ok(status) => Some(status),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(abandoned()),
        }
    }
}

impl Future for Completion {
    type Output = StreamStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StreamStatus> {
        Pin::new(&mut self.rx).poll(cx).map(|res| res.unwrap_or_else(|_| abandoned()))
    }
}

// The job was dropped without running, e.g. because the runtime shut down.
fn abandoned() -> StreamStatus {
    error!("background phase was dropped before it finished");
    StreamStatus::Continue
}
