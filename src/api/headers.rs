//! # Header and Trailer Handles
//!
//! Shared handles to the stream's header blocks. The host creates them, hands
//! clones to the manager, and keeps reading them after a phase returns. Every
//! handle guards its entries with a mutex because a background-dispatched
//! phase can touch them while the host thread does too.
//!
//! Keys are stored lowercase and may be HTTP/2 pseudo-headers such as
//! `:path`, which `http::HeaderMap` cannot hold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::Uri;

#[derive(Debug, Default)]
struct Entries {
    items: Vec<(String, String)>,
    uri: Option<Uri>,
}

/// A shared, ordered, multi-valued header block.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    inner: Arc<Mutex<Entries>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.lock().items.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
    }

    pub fn get_all(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.lock().items.iter().filter(|(k, _)| *k == key).map(|(_, v)| v.clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.lock().items.iter().any(|(k, _)| *k == key)
    }

    /// Replace every value of `key` with `value`.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let mut entries = self.lock();
        if key == ":path" {
            entries.uri = None;
        }
        entries.items.retain(|(k, _)| *k != key);
        entries.items.push((key, value.into()));
    }

    pub fn add(&self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let mut entries = self.lock();
        if key == ":path" {
            entries.uri = None;
        }
        entries.items.push((key, value.into()));
    }

    pub fn remove(&self, key: &str) {
        let key = key.to_ascii_lowercase();
        let mut entries = self.lock();
        if key == ":path" {
            entries.uri = None;
        }
        entries.items.retain(|(k, _)| *k != key);
    }

    /// Visit entries in insertion order until `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&str, &str) -> bool) {
        for (k, v) in self.lock().items.iter() {
            if !f(k, v) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Regular headers as an `http::HeaderMap`; pseudo-headers and invalid
    /// entries are left out.
    pub fn to_http(&self) -> http::HeaderMap {
        let mut out = http::HeaderMap::new();
        for (k, v) in self.lock().items.iter().filter(|(k, _)| !k.starts_with(':')) {
            if let (Ok(name), Ok(value)) =
                (http::header::HeaderName::try_from(k.as_str()), http::HeaderValue::try_from(v.as_str()))
            {
                out.append(name, value);
            }
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let items = iter
            .into_iter()
            .map(|(k, v)| (k.into().to_ascii_lowercase(), v.into()))
            .collect();
        Self { inner: Arc::new(Mutex::new(Entries { items, uri: None })) }
    }
}

/// Trailers share the header representation.
pub type TrailerMap = HeaderMap;
pub type RequestTrailerMap = TrailerMap;
pub type ResponseTrailerMap = TrailerMap;

/// Request headers with accessors for the pseudo-headers.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaderMap(HeaderMap);

impl RequestHeaderMap {
    pub fn new(headers: HeaderMap) -> Self {
        Self(headers)
    }

    pub fn scheme(&self) -> Option<String> {
        self.0.get(":scheme")
    }

    pub fn method(&self) -> Option<String> {
        self.0.get(":method")
    }

    pub fn host(&self) -> Option<String> {
        self.0.get(":authority")
    }

    pub fn path(&self) -> Option<String> {
        self.0.get(":path")
    }

    /// The parsed `:path`. Cached until `:path` is written again.
    pub fn uri(&self) -> Option<Uri> {
        let mut entries = self.0.lock();
        if entries.uri.is_none() {
            let path = entries.items.iter().find(|(k, _)| k == ":path").map(|(_, v)| v.clone())?;
            entries.uri = path.parse::<Uri>().ok();
        }
        entries.uri.clone()
    }

    pub fn query(&self) -> HashMap<String, String> {
        self.uri()
            .and_then(|uri| uri.query().map(str::to_string))
            .map(|q| {
                q.split('&')
                    .filter(|kv| !kv.is_empty())
                    .map(|kv| match kv.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (kv.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Value of the named cookie, across every `cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.0.get_all("cookie").iter().find_map(|line| {
            line.split(';').map(str::trim).find_map(|pair| match pair.split_once('=') {
                Some((k, v)) if k == name => Some(v.to_string()),
                _ => None,
            })
        })
    }
}

impl std::ops::Deref for RequestHeaderMap {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        &self.0
    }
}

impl From<HeaderMap> for RequestHeaderMap {
    fn from(headers: HeaderMap) -> Self {
        Self(headers)
    }
}

/// Response headers with a `:status` accessor.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaderMap(HeaderMap);

impl ResponseHeaderMap {
    pub fn new(headers: HeaderMap) -> Self {
        Self(headers)
    }

    pub fn status(&self) -> Option<u16> {
        self.0.get(":status").and_then(|s| s.parse().ok())
    }
}

impl std::ops::Deref for ResponseHeaderMap {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        &self.0
    }
}

impl From<HeaderMap> for ResponseHeaderMap {
    fn from(headers: HeaderMap) -> Self {
        Self(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_multi_value() {
        let h: HeaderMap = [("X-Id", "1"), ("x-id", "2")].into_iter().collect();
        assert_eq!(h.get("X-ID").as_deref(), Some("1"));
        assert_eq!(h.get_all("x-id"), vec!["1", "2"]);

        h.set("x-id", "3");
        assert_eq!(h.get_all("x-id"), vec!["3"]);

        h.remove("X-Id");
        assert!(!h.contains("x-id"));
    }

    #[test]
    fn test_clones_share_entries() {
        let h = HeaderMap::new();
        let other = h.clone();
        other.add("a", "b");
        assert_eq!(h.get("a").as_deref(), Some("b"));
    }

    #[test]
    fn test_uri_cache_invalidated_on_path_write() {
        let h: RequestHeaderMap =
            HeaderMap::from_iter([(":path", "/echo?a=1&b"), (":method", "GET")]).into();
        assert_eq!(h.uri().unwrap().path(), "/echo");
        assert_eq!(h.query().get("a").map(String::as_str), Some("1"));
        assert_eq!(h.query().get("b").map(String::as_str), Some(""));

        h.set(":path", "/other");
        assert_eq!(h.uri().unwrap().path(), "/other");
        assert!(h.query().is_empty());
    }

    #[test]
    fn test_cookie() {
        let h: RequestHeaderMap =
            HeaderMap::from_iter([("cookie", "a=1; session=xyz"), ("cookie", "b=2")]).into();
        assert_eq!(h.cookie("session").as_deref(), Some("xyz"));
        assert_eq!(h.cookie("b").as_deref(), Some("2"));
        assert_eq!(h.cookie("missing"), None);
    }

    #[test]
    fn test_to_http_skips_pseudo_headers() {
        let h = HeaderMap::from_iter([(":status", "200"), ("content-type", "text/plain")]);
        let out = h.to_http();
        assert_eq!(out.len(), 1);
        assert_eq!(out["content-type"], "text/plain");
        assert_eq!(ResponseHeaderMap::new(h).status(), Some(200));
    }
}
