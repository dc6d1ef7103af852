//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (already stamped by the instrumentation layer):
//!     → edge.rs (require the gateway's X-Forwarded-Host)
//!     → Pass to handlers
//! ```
//!
//! # Design Decisions
//! - Fail closed: a missing or different forwarded host is rejected
//! - Rejections still carry trace headers, since the guard runs inside
//!   the instrumentation layer

pub mod edge;

pub use edge::{check, edge_access_middleware, EdgeDecision};
