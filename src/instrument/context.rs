//! Per-request logging context.
//!
//! # Data Flow
//! ```text
//! blocking pipeline:  bind_thread() ──guard──▶ thread slot ──drop──▶ cleared
//! async pipeline:     scope(fut)    ──poll───▶ task-local  (re-installed on
//!                                              every poll, whatever worker
//!                                              thread runs it)
//! both:               span()        ──────────▶ tracing span fields
//! ```
//!
//! # Design Decisions
//! - The context is an immutable value; there is no global map to mutate
//! - Installation is always scoped, so no exit path can leak a request's
//!   fields into the next request served by a pooled thread
//! - `tracing` span fields are what actually reach log output

use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;

use axum::http::{Method, Uri};
use tracing::Span;

use crate::instrument::resolver::CorrelationId;

tokio::task_local! {
    static TASK_CONTEXT: LoggingContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<LoggingContext>> = const { RefCell::new(None) };
}

/// Fields bound for the duration of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingContext {
    pub trace_id: CorrelationId,
    pub method: Method,
    pub uri: String,
}

impl LoggingContext {
    pub fn new(trace_id: CorrelationId, method: Method, uri: &Uri) -> Self {
        Self {
            trace_id,
            method,
            uri: uri.path().to_string(),
        }
    }

    /// Span carrying the context fields, entered around request handling.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            trace_id = %self.trace_id,
            method = %self.method,
            uri = %self.uri,
        )
    }

    /// Install into the current thread's slot until the guard drops.
    pub fn bind_thread(&self) -> ThreadBinding {
        let previous = THREAD_CONTEXT.with(|slot| slot.replace(Some(self.clone())));
        ThreadBinding {
            previous,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with the context installed in the task-local slot.
    pub fn sync_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        TASK_CONTEXT.sync_scope(self.clone(), f)
    }

    /// Install for every poll of `fut`.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        TASK_CONTEXT.scope(self, fut).await
    }

    /// Context visible from here: task-local first, then the thread slot.
    pub fn current() -> Option<LoggingContext> {
        TASK_CONTEXT
            .try_with(|ctx| ctx.clone())
            .ok()
            .or_else(|| THREAD_CONTEXT.with(|slot| slot.borrow().clone()))
    }

    /// Correlation id of the context visible from here.
    pub fn current_trace_id() -> Option<CorrelationId> {
        Self::current().map(|ctx| ctx.trace_id)
    }
}

/// Guard returned by [`LoggingContext::bind_thread`].
///
/// Restores whatever the slot held before (normally nothing) on drop.
#[must_use = "the context is cleared as soon as the binding drops"]
pub struct ThreadBinding {
    previous: Option<LoggingContext>,
    // The slot belongs to the binding thread.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // Ignore access errors during thread teardown.
        let _ = THREAD_CONTEXT.try_with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: &str) -> LoggingContext {
        LoggingContext::new(
            CorrelationId::new(id).unwrap(),
            Method::GET,
            &Uri::from_static("/orders/7?verbose=1"),
        )
    }

    #[test]
    fn test_uri_field_is_path_only() {
        assert_eq!(ctx("a").uri, "/orders/7");
    }

    #[test]
    fn test_thread_binding_clears_on_drop() {
        assert!(LoggingContext::current().is_none());
        {
            let _binding = ctx("t-1").bind_thread();
            assert_eq!(LoggingContext::current_trace_id().unwrap().as_str(), "t-1");
        }
        assert!(LoggingContext::current().is_none());
    }

    #[test]
    fn test_nested_binding_restores_outer() {
        let _outer = ctx("outer").bind_thread();
        {
            let _inner = ctx("inner").bind_thread();
            assert_eq!(LoggingContext::current_trace_id().unwrap().as_str(), "inner");
        }
        assert_eq!(LoggingContext::current_trace_id().unwrap().as_str(), "outer");
    }

    #[test]
    fn test_binding_cleared_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _binding = ctx("doomed").bind_thread();
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert!(LoggingContext::current().is_none());
    }

    #[test]
    fn test_sync_scope() {
        let seen = ctx("s-1").sync_scope(LoggingContext::current_trace_id);
        assert_eq!(seen.unwrap().as_str(), "s-1");
        assert!(LoggingContext::current().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_task_scope_survives_worker_hops() {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                tokio::spawn(ctx(&format!("task-{i}")).scope(async move {
                    for _ in 0..8 {
                        tokio::task::yield_now().await;
                        let seen = LoggingContext::current_trace_id().unwrap();
                        assert_eq!(seen.as_str(), format!("task-{i}"));
                    }
                }))
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
