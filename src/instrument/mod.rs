//! Trace and timing instrumentation subsystem.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → tracer.rs (ambient trace scope, optional)
//!     → resolver.rs (pick correlation id: header / ambient / fallback)
//!     → context.rs (bind trace id, method, uri for log output)
//!     → blocking.rs | layer.rs (stamp request, delegate, stamp response)
//!     → timing.rs (encode marks, compute latencies)
//! outbound client call
//!     → outbound.rs (stamp sent/received marks, transmission time)
//! ```
//!
//! # Design Decisions
//! - Both pipelines produce the same headers and the same log lines
//! - All per-request state is owned by the request's own call; filters
//!   hold only immutable settings
//! - Instrumentation never changes a status code or a body

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::Extensions;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use thiserror::Error;

pub mod blocking;
pub mod context;
pub mod headers;
pub mod layer;
pub mod outbound;
pub mod resolver;
pub mod timing;
pub mod tracer;

pub use blocking::{BlockingHandler, BlockingService, BufferedResponse, CachedBody, RawResponse, SyncFilter};
pub use context::LoggingContext;
pub use layer::{TraceTimingLayer, TraceTimingService};
pub use outbound::{OutboundTimingLayer, OutboundTimingService};
pub use resolver::{resolve, CorrelationId, FALLBACK_TRACE_ID};
pub use timing::{delta_millis, TimestampMark, TimestampParseError};
pub use tracer::{ActiveTrace, AmbientTracer, NoopTracer, ScopedTracer, TraceScopeLayer};

/// Peer address recorded by `into_make_service_with_connect_info`.
pub(crate) fn remote_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0)
}

/// Why a request body could not be buffered.
#[derive(Debug, Error)]
pub enum BodyBufferError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Collect a request body into memory, refusing more than `limit` bytes.
pub async fn buffer_body(body: Body, limit: usize) -> Result<Bytes, BodyBufferError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyBufferError::TooLarge { limit }),
        Err(e) => Err(BodyBufferError::Read(e.to_string())),
    }
}

/// Body text for a log line: lossy UTF-8, cut at `limit` bytes.
pub(crate) fn body_preview(bytes: &[u8], limit: usize) -> Cow<'_, str> {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes);
    }
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    text.push_str(&format!("... ({} bytes)", bytes.len()));
    Cow::Owned(text)
}
