//! Request tracing and timing instrumentation for HTTP services.
//!
//! Every hop of a request chain reads or mints a correlation id
//! (`Trace-Id`), stamps wall-clock marks on the way in and out, and reports
//! per-hop latencies as response headers and structured log lines.

pub mod config;
pub mod http;
pub mod instrument;
pub mod observability;
pub mod security;

pub use config::schema::ServiceConfig;
pub use http::HttpServer;
