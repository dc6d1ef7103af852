//! Correlation id resolution.
//!
//! # Rules
//! ```text
//! incoming Trace-Id has a non-blank entry → first such entry (propagate)
//! else ambient tracer has an active span  → its trace id
//! else                                    → "default-trace-id"
//! ```

use std::fmt;

/// Sentinel used when neither the caller nor the ambient tracer supply an id.
pub const FALLBACK_TRACE_ID: &str = "default-trace-id";

/// Opaque identifier tying together all hops of one originating request.
///
/// Never empty or blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap `value` if it carries a non-blank id.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == value.len() {
            Some(Self(value))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// The sentinel id.
    pub fn fallback() -> Self {
        Self(FALLBACK_TRACE_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0 == FALLBACK_TRACE_ID
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Determine the correlation id for a request.
///
/// `incoming` are the values of the inbound `Trace-Id` header in arrival
/// order; `ambient` is the active tracer's trace id, if a span is open.
pub fn resolve<'a, I>(incoming: I, ambient: Option<String>) -> CorrelationId
where
    I: IntoIterator<Item = &'a str>,
{
    incoming
        .into_iter()
        .find_map(CorrelationId::new)
        .or_else(|| ambient.and_then(CorrelationId::new))
        .unwrap_or_else(CorrelationId::fallback)
}
