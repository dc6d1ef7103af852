//! Edge-only access guard.
//!
//! Services deployed behind the gateway accept traffic only when the
//! gateway forwarded it. The gateway marks requests with
//! `X-Forwarded-Host`; anything arriving without the expected value is a
//! direct call and is turned away.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::EdgeConfig;
use crate::instrument::headers::{self, X_FORWARDED_HOST};

pub const REJECTION_BODY: &str = "Direct access not allowed";

/// Outcome of the forwarded-host check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDecision {
    Allow,
    Reject,
}

/// Decide whether a request came through the gateway.
pub fn check(forwarded_host: Option<&str>, expected: &str) -> EdgeDecision {
    match forwarded_host {
        Some(host) if host == expected => EdgeDecision::Allow,
        _ => EdgeDecision::Reject,
    }
}

pub async fn edge_access_middleware(
    State(edge): State<Arc<EdgeConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let forwarded = headers::first(req.headers(), &X_FORWARDED_HOST);
    match check(forwarded, &edge.expected_forwarded_host) {
        EdgeDecision::Allow => next.run(req).await,
        EdgeDecision::Reject => {
            tracing::warn!(
                forwarded_host = forwarded.unwrap_or(""),
                path = %req.uri().path(),
                "Direct access rejected"
            );
            (StatusCode::FORBIDDEN, REJECTION_BODY).into_response()
        }
    }
}
