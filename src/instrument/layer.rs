//! Asynchronous (event-loop) instrumentation layer.
//!
//! # Request Lifecycle
//! ```text
//! call():  Stamp-In (new request value) → Bind → Log-Request
//!          → register before-commit hooks → Delegate
//! future:  downstream response ready → hook 1 (stamp response headers)
//!          → hook 2 (log response + latency) → hand response to server
//! ```
//!
//! # Design Decisions
//! - `call` never awaits; suspension happens only inside the returned future
//! - The service holds immutable settings only, so clones share nothing
//!   mutable and the layer is re-entrant
//! - Hooks run when the downstream future yields a response; if the
//!   future is dropped first (cancellation), no hook ever runs
//! - The request body is not buffered on this path

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{HeaderMap, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::config::InstrumentationConfig;
use crate::instrument::context::LoggingContext;
use crate::instrument::headers::{self, REQUEST_RECEIVED_TIME, RESPONSE_PROCESSING_TIME, RESPONSE_SENT_TIME, TRACE_ID};
use crate::instrument::remote_addr;
use crate::instrument::resolver::{resolve, CorrelationId};
use crate::instrument::timing::{delta_millis, TimestampMark};
use crate::instrument::tracer::AmbientTracer;
use crate::observability::metrics::{self, Hop};

type CommitHook = Box<dyn FnOnce(StatusCode, &mut HeaderMap) + Send>;

/// Callbacks run, in registration order, just before a response is handed
/// back to the server.
#[derive(Default)]
pub struct BeforeCommit {
    hooks: Vec<CommitHook>,
}

impl BeforeCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, hook: F)
    where
        F: FnOnce(StatusCode, &mut HeaderMap) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn fire<B>(self, response: &mut Response<B>) {
        let status = response.status();
        for hook in self.hooks {
            hook(status, response.headers_mut());
        }
    }
}

/// Return a copy of `req` stamped with `Request-Received-Time-In-Ms` and the
/// resolved `Trace-Id`, plus that id.
pub fn stamp_request<B>(req: Request<B>, tracer: &dyn AmbientTracer) -> (Request<B>, CorrelationId) {
    let (mut parts, body) = req.into_parts();
    let trace_id = resolve(
        headers::values(&parts.headers, &TRACE_ID),
        tracer.current_trace_id(),
    );
    headers::set(&mut parts.headers, REQUEST_RECEIVED_TIME, &TimestampMark::now().encode());
    headers::set(&mut parts.headers, TRACE_ID, trace_id.as_str());
    (Request::from_parts(parts, body), trace_id)
}

/// Layer adding trace and timing instrumentation to an async service.
#[derive(Clone)]
pub struct TraceTimingLayer {
    tracer: Arc<dyn AmbientTracer>,
    settings: Arc<InstrumentationConfig>,
}

impl TraceTimingLayer {
    pub fn new(tracer: Arc<dyn AmbientTracer>, settings: InstrumentationConfig) -> Self {
        Self {
            tracer,
            settings: Arc::new(settings),
        }
    }
}

impl<S> Layer<S> for TraceTimingLayer {
    type Service = TraceTimingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceTimingService {
            inner,
            tracer: Arc::clone(&self.tracer),
            settings: Arc::clone(&self.settings),
        }
    }
}

/// Service produced by [`TraceTimingLayer`].
#[derive(Clone)]
pub struct TraceTimingService<S> {
    inner: S,
    tracer: Arc<dyn AmbientTracer>,
    settings: Arc<InstrumentationConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TraceTimingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let started = Instant::now();

        // Stamp-In
        let (req, trace_id) = stamp_request(req, self.tracer.as_ref());
        let received = headers::first(req.headers(), &REQUEST_RECEIVED_TIME).map(str::to_string);

        // Bind
        let ctx = LoggingContext::new(trace_id.clone(), req.method().clone(), req.uri());
        let span = ctx.span();
        let quiet = self.settings.is_quiet_path(req.uri().path());

        let mut commit = BeforeCommit::new();
        commit.register(move |_status, headers| {
            stamp_response(headers, received.as_deref(), &trace_id);
        });
        if !quiet {
            commit.register(move |status, headers| log_response(status, headers, started));
        } else {
            commit.register(|status, headers| {
                metrics::record_hop(Hop::Ingress, status.as_u16(), processing_time(headers));
            });
        }

        let inner = &mut self.inner;
        let fut = span.in_scope(|| {
            ctx.sync_scope(|| {
                if !quiet {
                    log_request(&req);
                }
                // Delegate
                inner.call(req)
            })
        });

        Box::pin(
            ctx.scope(async move {
                match fut.await {
                    Ok(mut response) => {
                        commit.fire(&mut response);
                        Ok(response)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Downstream service failed");
                        Err(e)
                    }
                }
            })
            .instrument(span),
        )
    }
}

fn log_request<B>(req: &Request<B>) {
    tracing::info!(
        remote_addr = ?remote_addr(req.extensions()),
        uri = %req.uri(),
        method = %req.method(),
        headers = ?headers::describe(req.headers()),
        query = req.uri().query().unwrap_or(""),
        content_type = headers::content_type(req.headers()),
        accept = headers::first(req.headers(), &axum::http::header::ACCEPT).unwrap_or(""),
        "Request received"
    );
}

fn stamp_response(headers: &mut HeaderMap, received: Option<&str>, trace_id: &CorrelationId) {
    let sent = TimestampMark::now();
    if received.is_some() {
        match delta_millis(received, sent) {
            Ok(ms) => headers::set(headers, RESPONSE_PROCESSING_TIME, &ms.to_string()),
            Err(e) => tracing::debug!(error = %e, "Processing time unavailable"),
        }
    }
    headers::set(headers, RESPONSE_SENT_TIME, &sent.encode());
    headers::set(headers, TRACE_ID, trace_id.as_str());
}

fn log_response(status: StatusCode, headers: &mut HeaderMap, started: Instant) {
    let processing_ms = processing_time(headers);
    tracing::info!(
        status = status.as_u16(),
        headers = ?headers::describe(headers),
        content_type = headers::content_type(headers),
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Response sending"
    );
    tracing::info!(
        processing_time_ms = processing_ms.unwrap_or(0),
        "Response processing time"
    );
    metrics::record_hop(Hop::Ingress, status.as_u16(), processing_ms);
}

fn processing_time(headers: &HeaderMap) -> Option<u64> {
    headers::first(headers, &RESPONSE_PROCESSING_TIME).and_then(|v| v.parse().ok())
}
