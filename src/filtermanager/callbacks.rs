//! The per-stream [`FilterCallbackHandler`] handed to every filter.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::api::{ExecutionRecord, FilterCallbackHandler, HostStream, PluginState, StreamInfo};
use crate::consumer::{Consumer, ConsumerRegistry};

use super::wrapper::ExecutionRecorder;

pub(crate) struct StreamCallbacks {
    host: Arc<dyn HostStream>,
    namespace: String,
    consumers: Arc<dyn ConsumerRegistry>,
    consumer: Mutex<Option<Arc<Consumer>>>,
    stream_info: Mutex<Option<StreamInfo>>,
    plugin_state: PluginState,
    recorder: Arc<ExecutionRecorder>,
}

impl StreamCallbacks {
    pub(crate) fn new(
        host: Arc<dyn HostStream>,
        namespace: &str,
        consumers: Arc<dyn ConsumerRegistry>,
    ) -> Self {
        Self {
            host,
            namespace: namespace.to_string(),
            consumers,
            consumer: Mutex::new(None),
            stream_info: Mutex::new(None),
            plugin_state: PluginState::default(),
            recorder: Arc::new(ExecutionRecorder::default()),
        }
    }

    pub(crate) fn host(&self) -> &dyn HostStream {
        self.host.as_ref()
    }

    pub(crate) fn recorder(&self) -> Arc<ExecutionRecorder> {
        Arc::clone(&self.recorder)
    }
}

impl FilterCallbackHandler for StreamCallbacks {
    /// Fetched from the host once and cached for the rest of the stream.
    fn stream_info(&self) -> StreamInfo {
        let mut cached = self.stream_info.lock().unwrap_or_else(PoisonError::into_inner);
        cached.get_or_insert_with(|| self.host.stream_info()).clone()
    }

    fn lookup_consumer(&self, plugin_name: &str, key: &str) -> Option<Arc<Consumer>> {
        self.consumers.lookup(&self.namespace, plugin_name, key)
    }

    fn set_consumer(&self, consumer: Arc<Consumer>) {
        info!(namespace = %self.namespace, consumer = %consumer.name(), "set consumer");
        let mut slot = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = slot.as_ref() {
            if prev.name() != consumer.name() {
                warn!(previous = %prev.name(), consumer = %consumer.name(), "consumer replaced");
            }
        }
        *slot = Some(consumer);
    }

    fn consumer(&self) -> Option<Arc<Consumer>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn plugin_state(&self) -> &PluginState {
        &self.plugin_state
    }

    fn set_metadata(&self, namespace: &str, key: &str, value: serde_json::Value) {
        self.host.set_metadata(namespace, key, value);
    }

    fn execution_records(&self) -> Vec<ExecutionRecord> {
        self.recorder.snapshot()
    }
}
