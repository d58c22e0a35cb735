//! Results returned by every filter invocation.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// What a filter wants the chain to do next.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResultAction {
    /// Hand the call to the next filter.
    #[default]
    Continue,
    /// Buffer the whole body and trailers, then call `decode_request`
    /// (or `encode_response`) on this filter. Only meaningful from a headers phase.
    WaitAllData,
    /// Response headers only: hold the headers until the first data chunk arrives.
    WaitData,
    /// Stop the chain and reply to the client.
    LocalResponse(LocalResponse),
}

impl ResultAction {
    pub fn local_response(code: u16, msg: impl Into<String>) -> Self {
        ResultAction::LocalResponse(LocalResponse::new(code).with_msg(msg))
    }
}

/// A short-circuit reply produced by a filter.
///
/// A `code` of 0 is sent as 200.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalResponse {
    pub code: u16,
    pub msg: String,
    pub headers: HeaderMap,
}

impl LocalResponse {
    pub fn new(code: u16) -> Self {
        Self { code, ..Default::default() }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    /// Add a header; names or values that are not valid HTTP are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping invalid local response header"),
        }
        self
    }

    pub fn status(&self) -> u16 {
        if self.code == 0 {
            200
        } else {
            self.code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status() {
        assert_eq!(LocalResponse::default().status(), 200);
        assert_eq!(LocalResponse::new(403).status(), 403);
        assert_eq!(ResultAction::default(), ResultAction::Continue);
    }

    #[test]
    fn test_with_header() {
        let reply = LocalResponse::new(401)
            .with_msg("unauthorized")
            .with_header("www-authenticate", "Basic")
            .with_header("bad header", "x");
        assert_eq!(reply.headers.len(), 1);
        assert_eq!(reply.headers["www-authenticate"], "Basic");
    }
}
