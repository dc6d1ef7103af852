//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Filters produce:
//!     → logging.rs (structured log events inside request spans)
//!     → metrics.rs (hop counters and latency histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
