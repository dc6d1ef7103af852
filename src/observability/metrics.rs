//! Metrics collection and exposition.
//!
//! # Metrics
//! - `hoptrace_requests_total` (counter): requests by hop and status
//! - `hoptrace_hop_latency_ms` (histogram): processing/transmission time by hop
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; without an installed recorder
//!   the calls are no-ops
//! - Prometheus exposition is opt-in via config

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Which side of a hop a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// Request received by this service.
    Ingress,
    /// Request this service sent upstream.
    Outbound,
}

impl Hop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hop::Ingress => "ingress",
            Hop::Outbound => "outbound",
        }
    }
}

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record one completed hop.
pub fn record_hop(hop: Hop, status: u16, latency_ms: Option<u64>) {
    counter!(
        "hoptrace_requests_total",
        "hop" => hop.as_str(),
        "status" => status.to_string()
    )
    .increment(1);

    if let Some(ms) = latency_ms {
        histogram!("hoptrace_hop_latency_ms", "hop" => hop.as_str()).record(ms as f64);
    }
}
