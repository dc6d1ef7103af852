//! Outbound-client instrumentation.
//!
//! Wraps the HTTP client a service uses to call other services, so the
//! correlation id follows the request to the next hop and the round trip
//! is measured.
//!
//! # Headers
//! ```text
//! outgoing request:  Trace-Id, Request-Sent-Time-In-Ms
//! upstream reply:    Response-Received-Time-In-Ms,
//!                    Response-Transmission-Time-In-Ms
//! ```

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{Request, Response};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use tracing::Instrument;

use crate::instrument::context::LoggingContext;
use crate::instrument::headers::{
    self, REQUEST_SENT_TIME, RESPONSE_RECEIVED_TIME, RESPONSE_TRANSMISSION_TIME, TRACE_ID,
};
use crate::instrument::resolver::resolve;
use crate::instrument::timing::{delta_millis, TimestampMark};
use crate::instrument::tracer::AmbientTracer;
use crate::observability::metrics::{self, Hop};

/// Layer instrumenting an HTTP client service.
#[derive(Clone)]
pub struct OutboundTimingLayer {
    tracer: Arc<dyn AmbientTracer>,
}

impl OutboundTimingLayer {
    pub fn new(tracer: Arc<dyn AmbientTracer>) -> Self {
        Self { tracer }
    }
}

impl<S> Layer<S> for OutboundTimingLayer {
    type Service = OutboundTimingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OutboundTimingService {
            inner,
            tracer: Arc::clone(&self.tracer),
        }
    }
}

/// Service produced by [`OutboundTimingLayer`].
#[derive(Clone)]
pub struct OutboundTimingService<S> {
    inner: S,
    tracer: Arc<dyn AmbientTracer>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for OutboundTimingService<S>
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
        let (mut parts, body) = req.into_parts();

        // The request being served is the best ambient source; the tracer
        // covers calls made outside any request.
        let ambient = LoggingContext::current_trace_id()
            .map(|id| id.to_string())
            .or_else(|| self.tracer.current_trace_id());
        let trace_id = resolve(headers::values(&parts.headers, &TRACE_ID), ambient);
        let sent = TimestampMark::now().encode();
        headers::set(&mut parts.headers, REQUEST_SENT_TIME, &sent);
        headers::set(&mut parts.headers, TRACE_ID, trace_id.as_str());

        let target = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(
            uri = %parts.uri,
            method = %parts.method,
            headers = ?headers::describe(&parts.headers),
            content_type = headers::content_type(&parts.headers),
            accept = headers::first(&parts.headers, &axum::http::header::ACCEPT).unwrap_or(""),
            "Request sending"
        );

        let fut = self.inner.call(Request::from_parts(parts, body));

        Box::pin(
            async move {
                let mut response = match fut.await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(
                            target_host = %target,
                            trace_id = %trace_id,
                            error = %e,
                            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                            "Upstream call failed"
                        );
                        return Err(e);
                    }
                };

                let received = TimestampMark::now();
                let headers = response.headers_mut();
                headers::set(headers, RESPONSE_RECEIVED_TIME, &received.encode());
                let transmission_ms = match delta_millis(Some(&sent), received) {
                    Ok(ms) => {
                        headers::set(headers, RESPONSE_TRANSMISSION_TIME, &ms.to_string());
                        Some(ms)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Transmission time unavailable");
                        None
                    }
                };

                tracing::info!(
                    target_host = %target,
                    status = response.status().as_u16(),
                    headers = ?headers::describe(response.headers()),
                    content_type = headers::content_type(response.headers()),
                    "Response receiving"
                );
                tracing::info!(
                    target_host = %target,
                    transmission_time_ms = transmission_ms.unwrap_or(0),
                    "Response receiving time"
                );
                metrics::record_hop(Hop::Outbound, response.status().as_u16(), transmission_ms);

                Ok(response)
            }
            .in_current_span(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::resolver::{CorrelationId, FALLBACK_TRACE_ID};
    use crate::instrument::tracer::NoopTracer;
    use axum::http::{HeaderName, Method, Uri};
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    async fn upstream(req: Request<()>) -> Result<Response<()>, Infallible> {
        let mut res = Response::new(());
        for name in [&TRACE_ID, &REQUEST_SENT_TIME] {
            if let Some(v) = req.headers().get(name) {
                let seen: HeaderName = format!("x-seen-{}", name).parse().unwrap();
                res.headers_mut().insert(seen, v.clone());
            }
        }
        Ok(res)
    }

    fn layer() -> OutboundTimingLayer {
        OutboundTimingLayer::new(Arc::new(NoopTracer))
    }

    fn get(uri: &'static str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[tokio::test]
    async fn test_stamps_request_and_response() {
        let client = layer().layer(service_fn(upstream));
        let res = client.oneshot(get("http://orders.internal/items")).await.unwrap();

        let sent = res.headers().get("x-seen-request-sent-time-in-ms").unwrap();
        assert!(TimestampMark::decode(sent.to_str().unwrap()).is_ok());
        assert!(TimestampMark::decode(headers::first(res.headers(), &RESPONSE_RECEIVED_TIME).unwrap()).is_ok());
        let transmission: u64 = headers::first(res.headers(), &RESPONSE_TRANSMISSION_TIME)
            .unwrap()
            .parse()
            .unwrap();
        assert!(transmission < 5_000);
        assert_eq!(res.headers().get("x-seen-trace-id").unwrap(), FALLBACK_TRACE_ID);
    }

    #[tokio::test]
    async fn test_existing_trace_id_kept() {
        let mut req = get("http://orders.internal/items");
        req.headers_mut().insert(TRACE_ID, "caller-9".parse().unwrap());
        let client = layer().layer(service_fn(upstream));
        let res = client.oneshot(req).await.unwrap();
        assert_eq!(res.headers().get("x-seen-trace-id").unwrap(), "caller-9");
    }

    #[tokio::test]
    async fn test_trace_id_taken_from_request_being_served() {
        let ctx = LoggingContext::new(
            CorrelationId::new("served-1").unwrap(),
            Method::GET,
            &Uri::from_static("/relay"),
        );
        let client = layer().layer(service_fn(upstream));
        let res = ctx
            .scope(client.oneshot(get("http://orders.internal/items")))
            .await
            .unwrap();
        assert_eq!(res.headers().get("x-seen-trace-id").unwrap(), "served-1");
    }
}
