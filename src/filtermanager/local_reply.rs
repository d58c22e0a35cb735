//! Turning a filter's [`LocalResponse`] into the reply the host sends.

use http::header::CONTENT_TYPE;
use http::HeaderValue;

use crate::api::{LocalReply, LocalResponse, RequestHeaderMap, ResponseHeaderMap};

const APPLICATION_JSON: &str = "application/json";

/// Build the host reply, wrapping the message as `{"msg": ...}` when the
/// client is expecting JSON.
///
/// The response's content type decides when it has one; otherwise the
/// request's does, and a missing one means JSON.
pub(crate) fn build_local_reply(
    resp: LocalResponse,
    req_headers: Option<&RequestHeaderMap>,
    rsp_headers: Option<&ResponseHeaderMap>,
    details: &str,
) -> LocalReply {
    let status = resp.status();
    let LocalResponse { msg, mut headers, .. } = resp;

    let mut body = msg;
    if !body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
        let wants_json = match rsp_headers.and_then(|rsp| rsp.get("content-type")) {
            Some(ct) => is_json(&ct),
            None => req_headers
                .and_then(|req| req.get("content-type"))
                .map_or(true, |ct| is_json(&ct)),
        };
        if wants_json {
            body = serde_json::json!({ "msg": body }).to_string();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        }
    }

    LocalReply { status, body, headers, details: details.to_string() }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(APPLICATION_JSON))
}
