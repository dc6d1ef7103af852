//! Synchronous (thread-per-request) instrumentation filter.
//!
//! # Request Lifecycle
//! ```text
//! Intercept → Stamp-In → Bind → Log-Request → Delegate
//!           → Stamp-Out → Log-Response → Flush
//! ```
//!
//! The raw request body is a single-read stream: the filter reads it once
//! and hands downstream a [`CachedBody`] over the same bytes. Downstream
//! writes into a [`BufferedResponse`]; the filter inspects it, stamps the
//! timing headers and copies it onto the real response exactly once, also
//! when the handler failed or panicked.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tower::Service;

use crate::config::InstrumentationConfig;
use crate::instrument::context::LoggingContext;
use crate::instrument::headers::{self, REQUEST_RECEIVED_TIME, RESPONSE_PROCESSING_TIME, RESPONSE_SENT_TIME, TRACE_ID};
use crate::instrument::resolver::{resolve, CorrelationId};
use crate::instrument::timing::{delta_millis, TimestampMark};
use crate::instrument::tracer::{ActiveTrace, AmbientTracer};
use crate::instrument::{body_preview, buffer_body, remote_addr, BodyBufferError};
use crate::observability::metrics::{self, Hop};

/// Request body already read into memory, readable once more downstream.
#[derive(Debug, Clone, Default)]
pub struct CachedBody {
    cursor: Cursor<Bytes>,
}

impl CachedBody {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    /// All bytes, regardless of how much has been read.
    pub fn bytes(&self) -> &Bytes {
        self.cursor.get_ref()
    }

    pub fn into_bytes(self) -> Bytes {
        self.cursor.into_inner()
    }
}

impl Read for CachedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

/// Response under construction by a blocking handler.
#[derive(Debug, Clone, Default)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    fn from_raw<W>(raw: &RawResponse<W>) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers.clone(),
            body: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Bytes written so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Move status, headers and body onto the real response.
    fn commit<W: Write>(self, raw: &mut RawResponse<W>) -> io::Result<()> {
        raw.status = self.status;
        raw.headers = self.headers;
        raw.stream.write_all(&self.body)?;
        raw.stream.flush()
    }
}

impl Write for BufferedResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The real response: status line, headers and the client-bound stream.
#[derive(Debug)]
pub struct RawResponse<W> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub stream: W,
}

impl<W> RawResponse<W> {
    pub fn new(stream: W) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            stream,
        }
    }
}

impl RawResponse<Vec<u8>> {
    fn into_http(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.stream));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Downstream stage of the blocking pipeline.
pub trait BlockingHandler: Send + Sync {
    type Error: fmt::Display + fmt::Debug + Send + 'static;

    fn handle(
        &self,
        request: Request<CachedBody>,
        response: &mut BufferedResponse,
    ) -> Result<(), Self::Error>;
}

impl<F, E> BlockingHandler for F
where
    F: Fn(Request<CachedBody>, &mut BufferedResponse) -> Result<(), E> + Send + Sync,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    type Error = E;

    fn handle(
        &self,
        request: Request<CachedBody>,
        response: &mut BufferedResponse,
    ) -> Result<(), Self::Error> {
        self(request, response)
    }
}

/// Failures surfaced by [`SyncFilter::filter`].
#[derive(Debug, Error)]
pub enum BlockingError<E> {
    /// The downstream handler failed; the response was still stamped and flushed.
    #[error("handler failed: {0}")]
    Handler(E),

    /// The downstream handler panicked; the response was stamped as a 500.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Writing the buffered body to the client failed.
    #[error("failed to flush response body: {0}")]
    Flush(#[source] io::Error),
}

impl<E> BlockingError<E> {
    pub fn map_handler<F>(self, f: impl FnOnce(E) -> F) -> BlockingError<F> {
        match self {
            BlockingError::Handler(e) => BlockingError::Handler(f(e)),
            BlockingError::Panicked(message) => BlockingError::Panicked(message),
            BlockingError::Flush(e) => BlockingError::Flush(e),
        }
    }
}

/// Trace and timing filter for blocking pipelines.
#[derive(Clone)]
pub struct SyncFilter {
    tracer: Arc<dyn AmbientTracer>,
    settings: InstrumentationConfig,
}

impl SyncFilter {
    pub fn new(tracer: Arc<dyn AmbientTracer>, settings: InstrumentationConfig) -> Self {
        Self { tracer, settings }
    }

    /// Run one request through the filter and `handler`.
    ///
    /// Blocks the calling thread for the whole request. The logging context
    /// is bound to that thread only while this call runs.
    pub fn filter<R, W, H>(
        &self,
        request: Request<R>,
        response: &mut RawResponse<W>,
        handler: &H,
    ) -> Result<(), BlockingError<H::Error>>
    where
        R: Read,
        W: Write,
        H: BlockingHandler + ?Sized,
    {
        let started = Instant::now();
        let (mut parts, body) = request.into_parts();

        // Stamp-In
        let received = TimestampMark::now().encode();
        let trace_id = resolve(
            headers::values(&parts.headers, &TRACE_ID),
            self.tracer.current_trace_id(),
        );
        let mut stamped = parts.headers.clone();
        headers::set(&mut stamped, REQUEST_RECEIVED_TIME, &received);
        headers::set(&mut stamped, TRACE_ID, trace_id.as_str());
        parts.headers = stamped;

        // Bind
        let ctx = LoggingContext::new(trace_id.clone(), parts.method.clone(), &parts.uri);
        let span = ctx.span();
        let _entered = span.enter();
        let _binding = ctx.bind_thread();

        // Log-Request
        let body = read_body(body);
        let quiet = self.settings.is_quiet_path(parts.uri.path());
        if !quiet {
            tracing::info!(
                remote_addr = ?remote_addr(&parts.extensions),
                uri = %parts.uri,
                method = %parts.method,
                headers = ?headers::describe(&parts.headers),
                body = %self.loggable(&body),
                "Request received"
            );
        }

        // Delegate
        let mut buffered = BufferedResponse::from_raw(response);
        let delegated = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(Request::from_parts(parts, CachedBody::new(body)), &mut buffered)
        }));
        let outcome = match delegated {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Downstream handler failed");
                Err(BlockingError::Handler(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(panic = %message, "Downstream handler panicked");
                buffered.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                Err(BlockingError::Panicked(message))
            }
        };

        // Stamp-Out
        let processing_ms = stamp_out(&mut buffered.headers, &received, &trace_id);

        // Log-Response
        if !quiet {
            tracing::info!(
                status = buffered.status.as_u16(),
                headers = ?headers::describe(&buffered.headers),
                content_type = headers::content_type(&buffered.headers),
                body = %self.loggable(&buffered.body),
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Response sending"
            );
            tracing::info!(
                processing_time_ms = processing_ms.unwrap_or(0),
                "Response processing time"
            );
        }
        metrics::record_hop(Hop::Ingress, buffered.status.as_u16(), processing_ms);

        // Flush
        buffered.commit(response).map_err(BlockingError::Flush)?;
        outcome
    }

    fn loggable<'a>(&self, body: &'a [u8]) -> std::borrow::Cow<'a, str> {
        if self.settings.log_bodies {
            body_preview(body, self.settings.max_logged_body_bytes)
        } else {
            std::borrow::Cow::Borrowed("")
        }
    }
}

/// Set processing time, sent time and trace id on outgoing headers.
fn stamp_out(headers: &mut HeaderMap, received: &str, trace_id: &CorrelationId) -> Option<u64> {
    let sent = TimestampMark::now();
    let processing_ms = match delta_millis(Some(received), sent) {
        Ok(ms) => {
            headers::set(headers, RESPONSE_PROCESSING_TIME, &ms.to_string());
            Some(ms)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Processing time unavailable");
            None
        }
    };
    headers::set(headers, RESPONSE_SENT_TIME, &sent.encode());
    headers::set(headers, TRACE_ID, trace_id.as_str());
    processing_ms
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Read the whole single-read body; a failed read degrades to empty.
fn read_body<R: Read>(mut body: R) -> Bytes {
    let mut buf = Vec::new();
    match body.read_to_end(&mut buf) {
        Ok(_) => Bytes::from(buf),
        Err(e) => {
            tracing::error!(error = %e, "Error reading the request body");
            Bytes::new()
        }
    }
}

/// Body whose collection failed before reaching the filter.
struct FailedBody(String);

impl Read for FailedBody {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other(self.0.clone()))
    }
}

/// Handler answering 413 for a body over the buffering limit.
struct PayloadTooLarge {
    limit: usize,
}

impl BlockingHandler for PayloadTooLarge {
    type Error = Infallible;

    fn handle(
        &self,
        _request: Request<CachedBody>,
        response: &mut BufferedResponse,
    ) -> Result<(), Self::Error> {
        tracing::warn!(limit = self.limit, "Request body too large");
        response.set_status(StatusCode::PAYLOAD_TOO_LARGE);
        response
            .body
            .extend_from_slice(format!("Request body exceeds {} bytes", self.limit).as_bytes());
        Ok(())
    }
}

/// Axum service running a [`SyncFilter`] and a blocking handler on tokio's
/// blocking thread pool, one pooled thread per in-flight request.
pub struct BlockingService<H> {
    filter: Arc<SyncFilter>,
    handler: Arc<H>,
    body_limit: usize,
    timeout: Option<Duration>,
}

impl<H> BlockingService<H> {
    pub fn new(filter: SyncFilter, handler: H) -> Self {
        let body_limit = filter.settings.max_buffered_body_bytes;
        Self {
            filter: Arc::new(filter),
            handler: Arc::new(handler),
            body_limit,
            timeout: None,
        }
    }

    /// Answer 408 when the handler has not finished within `timeout`.
    ///
    /// The worker thread is not interrupted; it runs to completion and its
    /// response is discarded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<H> Clone for BlockingService<H> {
    fn clone(&self) -> Self {
        Self {
            filter: Arc::clone(&self.filter),
            handler: Arc::clone(&self.handler),
            body_limit: self.body_limit,
            timeout: self.timeout,
        }
    }
}

impl<H> Service<Request<Body>> for BlockingService<H>
where
    H: BlockingHandler + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let filter = Arc::clone(&self.filter);
        let handler = Arc::clone(&self.handler);
        let body_limit = self.body_limit;
        let timeout = self.timeout;
        let trace = ActiveTrace::current();

        // Marks for a response the worker does not deliver in time.
        let received = TimestampMark::now().encode();
        let trace_id = resolve(
            headers::values(req.headers(), &TRACE_ID),
            filter.tracer.current_trace_id(),
        );

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let intake = buffer_body(body, body_limit).await;

            let worker = tokio::task::spawn_blocking(move || {
                let run = move || {
                    let mut raw = RawResponse::new(Vec::new());
                    let outcome = match intake {
                        Ok(bytes) => filter
                            .filter(Request::from_parts(parts, Cursor::new(bytes)), &mut raw, handler.as_ref())
                            .map_err(|e| e.map_handler(|e| e.to_string())),
                        Err(BodyBufferError::TooLarge { limit }) => filter
                            .filter(Request::from_parts(parts, io::empty()), &mut raw, &PayloadTooLarge { limit })
                            .map_err(|e| e.map_handler::<String>(|never| match never {})),
                        Err(BodyBufferError::Read(e)) => filter
                            .filter(Request::from_parts(parts, FailedBody(e)), &mut raw, handler.as_ref())
                            .map_err(|e| e.map_handler(|e| e.to_string())),
                    };
                    (raw, outcome)
                };
                match trace {
                    Some(trace) => trace.sync_scope(run),
                    None => run(),
                }
            });

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, worker).await {
                    Ok(joined) => joined,
                    Err(_) => return Ok(timed_out(&trace_id, &received, limit)),
                },
                None => worker.await,
            };

            let response = match joined {
                Ok((raw, Ok(()))) => raw.into_http(),
                Ok((mut raw, Err(BlockingError::Handler(_) | BlockingError::Panicked(_)))) => {
                    if !raw.status.is_client_error() && !raw.status.is_server_error() {
                        raw.status = StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    raw.into_http()
                }
                Ok((_, Err(BlockingError::Flush(e)))) => {
                    tracing::error!(error = %e, "Failed to buffer response body");
                    status_only(StatusCode::INTERNAL_SERVER_ERROR)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Blocking worker did not complete");
                    status_only(StatusCode::INTERNAL_SERVER_ERROR)
                }
            };
            Ok(response)
        })
    }
}

/// Stamped 408 for a request whose worker missed the deadline.
fn timed_out(trace_id: &CorrelationId, received: &str, limit: Duration) -> Response<Body> {
    let mut response = status_only(StatusCode::REQUEST_TIMEOUT);
    let processing_ms = stamp_out(response.headers_mut(), received, trace_id);
    tracing::warn!(
        trace_id = %trace_id,
        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        "Blocking handler timed out"
    );
    metrics::record_hop(Hop::Ingress, StatusCode::REQUEST_TIMEOUT.as_u16(), processing_ms);
    response
}

fn status_only(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::resolver::FALLBACK_TRACE_ID;
    use crate::instrument::tracer::NoopTracer;
    use axum::http::HeaderValue;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct FixedTracer(&'static str);

    impl AmbientTracer for FixedTracer {
        fn current_trace_id(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn filter_with(tracer: impl AmbientTracer) -> SyncFilter {
        SyncFilter::new(Arc::new(tracer), InstrumentationConfig::default())
    }

    fn request(uri: &str, trace_id: Option<&str>, body: &'static [u8]) -> Request<&'static [u8]> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(id) = trace_id {
            builder = builder.header("Trace-Id", id);
        }
        builder.body(body).unwrap()
    }

    fn echo(req: Request<CachedBody>, res: &mut BufferedResponse) -> Result<(), io::Error> {
        let mut body = req.into_body();
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)?;
        res.headers_mut()
            .insert("content-type", HeaderValue::from_static("application/octet-stream"));
        res.write_all(&buf)
    }

    #[test]
    fn test_body_passthrough_is_byte_identical() {
        let payload: &'static [u8] = b"\x00\x01binary\xffpayload\n{\"k\":1}";
        let mut raw = RawResponse::new(Vec::new());
        filter_with(NoopTracer)
            .filter(request("/orders", None, payload), &mut raw, &echo)
            .unwrap();
        assert_eq!(raw.stream, payload);
        assert_eq!(raw.status, StatusCode::OK);
    }

    #[test]
    fn test_ambient_trace_id_stamped_and_echoed() {
        let seen = Mutex::new(Vec::new());
        let handler = |req: Request<CachedBody>, _res: &mut BufferedResponse| {
            let h = req.headers();
            seen.lock().unwrap().push((
                headers::first(h, &TRACE_ID).map(str::to_string),
                headers::first(h, &REQUEST_RECEIVED_TIME).map(str::to_string),
            ));
            Ok::<_, Infallible>(())
        };

        let mut raw = RawResponse::new(Vec::new());
        filter_with(FixedTracer("abc123"))
            .filter(request("/orders", None, b""), &mut raw, &handler)
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen[0].0.as_deref(), Some("abc123"));
        assert!(TimestampMark::decode(seen[0].1.as_deref().unwrap()).is_ok());

        assert_eq!(headers::first(&raw.headers, &TRACE_ID), Some("abc123"));
        let processing: u64 = headers::first(&raw.headers, &RESPONSE_PROCESSING_TIME)
            .unwrap()
            .parse()
            .unwrap();
        assert!(processing < 5_000);
        assert!(TimestampMark::decode(headers::first(&raw.headers, &RESPONSE_SENT_TIME).unwrap()).is_ok());
    }

    #[test]
    fn test_incoming_trace_id_propagated() {
        let mut raw = RawResponse::new(Vec::new());
        filter_with(FixedTracer("ambient"))
            .filter(request("/orders", Some("caller-7"), b""), &mut raw, &echo)
            .unwrap();
        assert_eq!(headers::first(&raw.headers, &TRACE_ID), Some("caller-7"));
    }

    #[test]
    fn test_fallback_without_tracer() {
        let mut raw = RawResponse::new(Vec::new());
        filter_with(NoopTracer)
            .filter(request("/orders", None, b""), &mut raw, &echo)
            .unwrap();
        assert_eq!(headers::first(&raw.headers, &TRACE_ID), Some(FALLBACK_TRACE_ID));
    }

    #[test]
    fn test_no_context_leak_between_sequential_requests() {
        let seen = Mutex::new(Vec::new());
        let handler = |_req: Request<CachedBody>, _res: &mut BufferedResponse| {
            seen.lock()
                .unwrap()
                .push(LoggingContext::current_trace_id().map(|id| id.to_string()));
            Ok::<_, Infallible>(())
        };
        let filter = filter_with(NoopTracer);

        let mut first = RawResponse::new(Vec::new());
        filter.filter(request("/a", Some("first"), b""), &mut first, &handler).unwrap();
        assert!(LoggingContext::current().is_none());

        let mut second = RawResponse::new(Vec::new());
        filter.filter(request("/b", None, b""), &mut second, &handler).unwrap();
        assert!(LoggingContext::current().is_none());

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![Some("first".to_string()), Some(FALLBACK_TRACE_ID.to_string())]
        );
    }

    #[test]
    fn test_handler_failure_still_stamped_and_flushed() {
        let handler = |_req: Request<CachedBody>, res: &mut BufferedResponse| -> io::Result<()> {
            res.set_status(StatusCode::BAD_GATEWAY);
            res.write_all(b"partial")?;
            Err(io::Error::other("downstream exploded"))
        };

        let mut raw = RawResponse::new(Vec::new());
        let err = filter_with(NoopTracer)
            .filter(request("/orders", Some("t-err"), b""), &mut raw, &handler)
            .unwrap_err();

        assert!(matches!(err, BlockingError::Handler(_)));
        assert_eq!(raw.status, StatusCode::BAD_GATEWAY);
        assert_eq!(raw.stream, b"partial");
        assert!(raw.headers.contains_key(RESPONSE_SENT_TIME));
        assert_eq!(headers::first(&raw.headers, &TRACE_ID), Some("t-err"));
        assert!(LoggingContext::current().is_none());
    }

    #[test]
    fn test_body_read_failure_degrades_to_empty() {
        let req = Request::builder()
            .uri("/orders")
            .body(FailedBody("connection reset".into()))
            .unwrap();
        let mut raw = RawResponse::new(Vec::new());
        filter_with(NoopTracer).filter(req, &mut raw, &echo).unwrap();
        assert!(raw.stream.is_empty());
        assert!(raw.headers.contains_key(RESPONSE_PROCESSING_TIME));
    }

    #[test]
    fn test_pre_existing_response_headers_kept() {
        let mut raw = RawResponse::new(Vec::new());
        raw.headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
        filter_with(NoopTracer)
            .filter(request("/orders", None, b"x"), &mut raw, &echo)
            .unwrap();
        assert_eq!(raw.headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(raw.headers.get("content-type").unwrap(), "application/octet-stream");
    }

    #[test]
    fn test_pooled_worker_reuse_sees_own_trace_ids() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |req: Request<CachedBody>, _res: &mut BufferedResponse| {
            let bound = LoggingContext::current_trace_id().map(|id| id.to_string());
            let header = headers::first(req.headers(), &TRACE_ID).map(str::to_string);
            sink.lock().unwrap().push((std::thread::current().id(), bound, header));
            Ok::<_, Infallible>(())
        };
        let service = BlockingService::new(filter_with(NoopTracer), handler);

        runtime.block_on(async {
            for id in ["req-1", "req-2"] {
                let req = Request::builder()
                    .uri("/orders")
                    .header("Trace-Id", id)
                    .body(Body::empty())
                    .unwrap();
                let res = service.clone().oneshot(req).await.unwrap();
                assert_eq!(headers::first(res.headers(), &TRACE_ID), Some(id));
            }
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0, "both requests should run on the one pooled thread");
        assert_eq!(seen[0].1.as_deref(), Some("req-1"));
        assert_eq!(seen[1].1.as_deref(), Some("req-2"));
        assert_eq!(seen[1].2.as_deref(), Some("req-2"));
    }

    #[test]
    fn test_handler_panic_still_stamped_and_flushed() {
        let handler = |_req: Request<CachedBody>, res: &mut BufferedResponse| -> io::Result<()> {
            res.write_all(b"half")?;
            panic!("inventory lookup blew up");
        };

        let mut raw = RawResponse::new(Vec::new());
        let err = filter_with(NoopTracer)
            .filter(request("/orders", Some("t-panic"), b""), &mut raw, &handler)
            .unwrap_err();

        assert!(matches!(err, BlockingError::Panicked(ref m) if m == "inventory lookup blew up"));
        assert_eq!(raw.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(headers::first(&raw.headers, &TRACE_ID), Some("t-panic"));
        assert!(raw.headers.contains_key(RESPONSE_SENT_TIME));
        assert!(raw.headers.contains_key(RESPONSE_PROCESSING_TIME));
        assert!(LoggingContext::current().is_none());
    }

    #[tokio::test]
    async fn test_service_stamps_panicking_handler() {
        let handler = |_req: Request<CachedBody>, _res: &mut BufferedResponse| -> Result<(), String> {
            panic!("boom");
        };
        let service = BlockingService::new(filter_with(NoopTracer), handler);
        let req = Request::builder()
            .header("Trace-Id", "p-1")
            .body(Body::empty())
            .unwrap();
        let res = service.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(headers::first(res.headers(), &TRACE_ID), Some("p-1"));
        assert!(res.headers().contains_key(RESPONSE_SENT_TIME));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_with_413() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let handler = move |_req: Request<CachedBody>, _res: &mut BufferedResponse| {
            *counter.lock().unwrap() += 1;
            Ok::<_, Infallible>(())
        };
        let settings = InstrumentationConfig {
            max_buffered_body_bytes: 1024,
            ..Default::default()
        };
        let service = BlockingService::new(SyncFilter::new(Arc::new(NoopTracer), settings), handler);

        let req = Request::builder()
            .method("POST")
            .uri("/orders")
            .header("Trace-Id", "big-1")
            .body(Body::from(vec![b'x'; 3 * 1024]))
            .unwrap();
        let res = service.oneshot(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(headers::first(res.headers(), &TRACE_ID), Some("big-1"));
        assert!(res.headers().contains_key(RESPONSE_SENT_TIME));
        assert!(res.headers().contains_key(RESPONSE_PROCESSING_TIME));
        assert_eq!(*calls.lock().unwrap(), 0, "handler must not see a truncated body");
    }

    #[tokio::test]
    async fn test_body_at_limit_reaches_handler() {
        let settings = InstrumentationConfig {
            max_buffered_body_bytes: 1024,
            ..Default::default()
        };
        let service = BlockingService::new(SyncFilter::new(Arc::new(NoopTracer), settings), echo);
        let req = Request::builder()
            .method("POST")
            .body(Body::from(vec![b'y'; 1024]))
            .unwrap();
        let res = service.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 4096).await.unwrap();
        assert_eq!(body.len(), 1024);
    }

    #[tokio::test]
    async fn test_timed_out_worker_answers_stamped_408() {
        let handler = |_req: Request<CachedBody>, _res: &mut BufferedResponse| {
            std::thread::sleep(Duration::from_millis(400));
            Ok::<_, Infallible>(())
        };
        let service = BlockingService::new(filter_with(NoopTracer), handler)
            .with_timeout(Duration::from_millis(100));
        let req = Request::builder()
            .uri("/slow")
            .header("Trace-Id", "slow-1")
            .body(Body::empty())
            .unwrap();
        let res = service.oneshot(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(headers::first(res.headers(), &TRACE_ID), Some("slow-1"));
        assert!(TimestampMark::decode(headers::first(res.headers(), &RESPONSE_SENT_TIME).unwrap()).is_ok());
        let processing: u64 = headers::first(res.headers(), &RESPONSE_PROCESSING_TIME)
            .unwrap()
            .parse()
            .unwrap();
        assert!(processing >= 90);
    }

    #[tokio::test]
    async fn test_service_maps_handler_error_to_500() {
        let handler = |_req: Request<CachedBody>, _res: &mut BufferedResponse| {
            Err::<(), String>("boom".to_string())
        };
        let service = BlockingService::new(filter_with(NoopTracer), handler);
        let res = service.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(res.headers().contains_key(RESPONSE_SENT_TIME));
    }
}
