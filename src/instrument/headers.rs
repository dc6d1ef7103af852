//! Timing and correlation header names.
//!
//! Header names are case-insensitive on the wire; `HeaderName` stores them
//! lowercased, so `Trace-Id` and `trace-id` address the same entry.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Correlation identifier, propagated unchanged across hops.
pub const TRACE_ID: HeaderName = HeaderName::from_static("trace-id");

/// Mark stamped on the inbound request when it arrives at a hop.
pub const REQUEST_RECEIVED_TIME: HeaderName = HeaderName::from_static("request-received-time-in-ms");

/// Mark stamped on an outgoing client request when it is forwarded upstream.
pub const REQUEST_SENT_TIME: HeaderName = HeaderName::from_static("request-sent-time-in-ms");

/// Mark stamped on an upstream reply when it arrives back.
pub const RESPONSE_RECEIVED_TIME: HeaderName = HeaderName::from_static("response-received-time-in-ms");

/// Milliseconds between `Request-Sent-Time-In-Ms` and `Response-Received-Time-In-Ms`.
pub const RESPONSE_TRANSMISSION_TIME: HeaderName =
    HeaderName::from_static("response-transmission-time-in-ms");

/// Milliseconds between `Request-Received-Time-In-Ms` and `Response-Sent-Time-In-Ms`.
pub const RESPONSE_PROCESSING_TIME: HeaderName =
    HeaderName::from_static("response-processing-time-in-ms");

/// Mark stamped on the response when it leaves the hop.
pub const RESPONSE_SENT_TIME: HeaderName = HeaderName::from_static("response-sent-time-in-ms");

/// Proxy header checked by the edge access filter.
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// All values of `name` that are valid visible ASCII, in arrival order.
pub fn values<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers.get_all(name).iter().filter_map(|v| v.to_str().ok())
}

/// First value of `name` as text, if any.
pub fn first<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    values(headers, name).next()
}

/// Replace every value of `name` with `value`.
///
/// Values that cannot be represented as a header (control characters) are
/// skipped with a debug log; instrumentation never fails a request.
pub fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => {
            tracing::debug!(header = %name, "Skipping header with non-representable value");
        }
    }
}

/// Render headers as `name: [v1, v2]` entries for log lines.
pub fn describe(headers: &HeaderMap) -> Vec<String> {
    headers
        .keys()
        .map(|name| {
            let vals: Vec<&str> = headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().unwrap_or("<binary>"))
                .collect();
            format!("{}: [{}]", name, vals.join(", "))
        })
        .collect()
}

/// Content type of a header map, or an empty string.
pub fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Trace-Id", HeaderValue::from_static("abc"));
        assert_eq!(first(&headers, &TRACE_ID), Some("abc"));
    }

    #[test]
    fn test_describe_groups_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append(TRACE_ID, HeaderValue::from_static("a"));
        headers.append(TRACE_ID, HeaderValue::from_static("b"));
        assert_eq!(describe(&headers), vec!["trace-id: [a, b]".to_string()]);
    }

    #[test]
    fn test_set_replaces_all_values() {
        let mut headers = HeaderMap::new();
        headers.append(TRACE_ID, HeaderValue::from_static("a"));
        headers.append(TRACE_ID, HeaderValue::from_static("b"));
        set(&mut headers, TRACE_ID, "c");
        assert_eq!(values(&headers, &TRACE_ID).collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_set_skips_invalid_value() {
        let mut headers = HeaderMap::new();
        set(&mut headers, TRACE_ID, "bad\nvalue");
        assert!(headers.get(TRACE_ID).is_none());
    }
}
