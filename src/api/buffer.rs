//! Shared body buffer handle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};

/// A body chunk shared between the host and the filters.
///
/// Filters mutate it in place; the host forwards whatever it holds once the
/// phase completes.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    inner: Arc<Mutex<BytesMut>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current contents.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Replace the contents.
    pub fn set(&self, data: impl AsRef<[u8]>) {
        let mut buf = self.lock();
        buf.clear();
        buf.extend_from_slice(data.as_ref());
    }

    pub fn append(&self, data: impl AsRef<[u8]>) {
        self.lock().extend_from_slice(data.as_ref());
    }

    pub fn prepend(&self, data: impl AsRef<[u8]>) {
        let mut buf = self.lock();
        let mut joined = BytesMut::with_capacity(buf.len() + data.as_ref().len());
        joined.extend_from_slice(data.as_ref());
        joined.extend_from_slice(&buf);
        *buf = joined;
    }

    /// Remove and return the contents.
    pub fn take(&self) -> Bytes {
        self.lock().split().freeze()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Buffer::from(s.as_bytes())
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self { inner: Arc::new(Mutex::new(BytesMut::from(data))) }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from(data.as_slice())
    }
}
