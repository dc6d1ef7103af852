//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files and
//! default every field, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for the instrumented service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration.
    pub listener: ListenerConfig,

    /// Which instrumentation flavour serves requests.
    pub pipeline: Pipeline,

    /// Trace and timing filter settings.
    pub instrumentation: InstrumentationConfig,

    /// Edge access check.
    pub edge: EdgeConfig,

    /// Upstream relay target. Requests are echoed when unset.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Request pipeline flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    /// Non-blocking tower layer on the event loop.
    #[default]
    Async,
    /// Thread-per-request filter on the blocking pool.
    Blocking,
}

/// Trace and timing filter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Requests whose path contains any of these are not logged.
    pub skip_path_fragments: Vec<String>,

    /// Include request/response bodies in log lines (blocking pipeline).
    pub log_bodies: bool,

    /// Longest body prefix written to a log line, in bytes.
    pub max_logged_body_bytes: usize,

    /// Largest request body the blocking pipeline buffers, in bytes.
    pub max_buffered_body_bytes: usize,

    /// Open an ambient trace per request (continuing `traceparent`).
    /// When off, requests without a `Trace-Id` get the fallback id.
    pub ambient_tracer: bool,
}

impl InstrumentationConfig {
    /// True when log lines for `path` are suppressed.
    pub fn is_quiet_path(&self, path: &str) -> bool {
        self.skip_path_fragments
            .iter()
            .any(|fragment| !fragment.is_empty() && path.contains(fragment.as_str()))
    }
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            skip_path_fragments: vec!["actuator".to_string(), "swagger".to_string()],
            log_bodies: true,
            max_logged_body_bytes: 16 * 1024,
            max_buffered_body_bytes: 2 * 1024 * 1024, // 2MB
            ambient_tracer: true,
        }
    }
}

/// Edge access check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Reject requests that did not come through the gateway.
    pub enabled: bool,

    /// Required `X-Forwarded-Host` value (exact match).
    pub expected_forwarded_host: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expected_forwarded_host: "localhost:8000".to_string(),
        }
    }
}

/// Upstream relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL requests are relayed to (e.g., "http://127.0.0.1:9000").
    pub base_url: Option<String>,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout_secs: 5,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
