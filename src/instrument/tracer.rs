//! Ambient trace facility.
//!
//! # Responsibilities
//! - Open one trace per inbound request (`TraceScopeLayer`)
//! - Continue a W3C `traceparent` trace id when the caller sent one
//! - Expose the active trace id to filters without threading it through
//!   every signature (`AmbientTracer`)
//!
//! # Design Decisions
//! - The active trace lives in a tokio task-local, installed for the
//!   synchronous `call` and for every poll of the returned future
//! - Blocking workers re-install it with `ActiveTrace::sync_scope`
//! - Filters depend on the `AmbientTracer` trait only, so tests and
//!   embedders can plug in their own facility

use std::fmt;
use std::future::Future;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, HeaderName, Request};
use tokio::task::futures::TaskLocalFuture;
use tower::{Layer, Service};
use uuid::Uuid;

/// W3C trace context header.
pub const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

tokio::task_local! {
    static ACTIVE_TRACE: ActiveTrace;
}

/// Source of the current trace id, if a span is active.
///
/// Implementations are read concurrently by every in-flight request.
pub trait AmbientTracer: Send + Sync + 'static {
    fn current_trace_id(&self) -> Option<String>;
}

/// Tracer that never has an active span.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl AmbientTracer for NoopTracer {
    fn current_trace_id(&self) -> Option<String> {
        None
    }
}

/// Tracer reading the trace opened by [`TraceScopeLayer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopedTracer;

impl AmbientTracer for ScopedTracer {
    fn current_trace_id(&self) -> Option<String> {
        ActiveTrace::current().map(|t| t.trace_id)
    }
}

/// The trace a request executes under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTrace {
    trace_id: String,
}

impl ActiveTrace {
    /// Start a new trace with a random 128-bit id.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Continue the trace named by a `traceparent` value
    /// (`version-traceid-parentid-flags`).
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let flags = parts.next()?;

        let is_hex = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        };
        if !is_hex(version, 2) || version == "ff" || !is_hex(parent_id, 16) || !is_hex(flags, 2) {
            return None;
        }
        if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_string(),
        })
    }

    /// Continue the caller's trace if it sent a valid `traceparent`, else start one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::from_traceparent)
            .unwrap_or_else(Self::new_root)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// The trace installed for the current task, if any.
    pub fn current() -> Option<ActiveTrace> {
        ACTIVE_TRACE.try_with(|t| t.clone()).ok()
    }

    /// Run `f` with this trace active, e.g. on a blocking worker thread.
    pub fn sync_scope<F, R>(self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        ACTIVE_TRACE.sync_scope(self, f)
    }

    /// Keep this trace active for every poll of `fut`.
    pub fn scope<F>(self, fut: F) -> TaskLocalFuture<ActiveTrace, F>
    where
        F: Future,
    {
        ACTIVE_TRACE.scope(self, fut)
    }
}

impl fmt::Display for ActiveTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.trace_id)
    }
}

/// Layer opening an [`ActiveTrace`] around each request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceScopeLayer;

impl<S> Layer<S> for TraceScopeLayer {
    type Service = TraceScope<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceScope { inner }
    }
}

/// Service produced by [`TraceScopeLayer`].
#[derive(Debug, Clone)]
pub struct TraceScope<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for TraceScope<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TaskLocalFuture<ActiveTrace, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let trace = ActiveTrace::from_headers(req.headers());
        let inner = &mut self.inner;
        let fut = trace.clone().sync_scope(|| inner.call(req));
        trace.scope(fut)
    }
}
