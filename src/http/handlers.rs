//! Demo endpoints served behind the instrumentation.
//!
//! # Responsibilities
//! - `/actuator/health` liveness probe (quiet path, still stamped)
//! - Catch-all that echoes the request as JSON, or relays it to the
//!   configured upstream through the instrumented outbound client
//! - Blocking-pipeline counterpart of the same endpoints

use std::io::Write;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::Serialize;
use tower::ServiceExt;

use crate::config::EdgeConfig;
use crate::instrument::headers::{self, X_FORWARDED_HOST};
use crate::instrument::{
    buffer_body, BlockingHandler, BodyBufferError, BufferedResponse, CachedBody, LoggingContext,
    OutboundTimingService,
};
use crate::security::edge::{self, EdgeDecision, REJECTION_BODY};

pub const HEALTH_PATH: &str = "/actuator/health";

/// HTTP client with outbound trace and timing instrumentation.
pub type RelayClient = OutboundTimingService<Client<HttpConnector, Body>>;

/// Where relayed requests go.
#[derive(Clone)]
pub struct Relay {
    pub client: RelayClient,
    pub base_url: String,
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Option<Relay>,
    /// Largest request body the echo endpoint buffers, in bytes.
    pub body_limit: usize,
}

/// Body of an echo reply.
#[derive(Debug, Serialize)]
pub struct EchoReply {
    pub method: String,
    pub uri: String,
    pub trace_id: Option<String>,
    pub body: String,
}

impl EchoReply {
    fn new(method: &Method, uri: &Uri, body: &[u8]) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            trace_id: LoggingContext::current_trace_id().map(|id| id.to_string()),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

pub async fn health() -> &'static str {
    "UP"
}

/// Echo the request, or relay it when an upstream is configured.
pub async fn catch_all(State(state): State<AppState>, request: Request<Body>) -> Response {
    match state.relay {
        Some(relay) => relay_request(relay, request).await,
        None => echo(request, state.body_limit).await,
    }
}

async fn echo(request: Request<Body>, body_limit: usize) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match buffer_body(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(e @ BodyBufferError::TooLarge { .. }) => {
            tracing::warn!(limit = body_limit, "Request body too large");
            return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to read request body");
            Bytes::new()
        }
    };
    Json(EchoReply::new(&parts.method, &parts.uri, &bytes)).into_response()
}

async fn relay_request(relay: Relay, request: Request<Body>) -> Response {
    let (mut parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", relay.base_url.trim_end_matches('/'), path_and_query);

    parts.uri = match target.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(target_uri = %target, error = %e, "Invalid relay target");
            return (StatusCode::BAD_GATEWAY, "Invalid upstream target").into_response();
        }
    };
    // The client derives Host from the target URI.
    parts.headers.remove(header::HOST);

    match relay.client.oneshot(Request::from_parts(parts, body)).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            tracing::error!(error = %e, "Upstream error");
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}

/// The demo endpoints for the thread-per-request pipeline.
///
/// The edge check runs here rather than as middleware so rejected requests
/// pass through the filter and are stamped like any other.
#[derive(Debug, Clone, Default)]
pub struct BlockingEndpoints {
    pub edge: Option<EdgeConfig>,
}

impl BlockingHandler for BlockingEndpoints {
    type Error = serde_json::Error;

    fn handle(
        &self,
        request: Request<CachedBody>,
        response: &mut BufferedResponse,
    ) -> Result<(), Self::Error> {
        if let Some(edge) = &self.edge {
            let forwarded = headers::first(request.headers(), &X_FORWARDED_HOST);
            if edge::check(forwarded, &edge.expected_forwarded_host) == EdgeDecision::Reject {
                tracing::warn!(
                    forwarded_host = forwarded.unwrap_or(""),
                    "Direct access rejected"
                );
                response.set_status(StatusCode::FORBIDDEN);
                write_text(response, REJECTION_BODY);
                return Ok(());
            }
        }

        if request.uri().path() == HEALTH_PATH {
            write_text(response, "UP");
            return Ok(());
        }

        let (parts, body) = request.into_parts();
        let reply = EchoReply::new(&parts.method, &parts.uri, body.bytes());
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        serde_json::to_writer(response, &reply)
    }
}

fn write_text(response: &mut BufferedResponse, text: &str) {
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    // Writes into the in-memory buffer cannot fail.
    let _ = response.write_all(text.as_bytes());
}
