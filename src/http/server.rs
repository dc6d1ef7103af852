//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the demo handlers
//! - Wire up instrumentation for the configured pipeline
//! - Build the instrumented relay client when an upstream is configured
//! - Bind server to listener, shut down gracefully
//!
//! # Layer order (outermost first)
//! ```text
//! TraceLayer → TraceScopeLayer → TraceTimingLayer → edge guard → timeout → handlers
//! TraceLayer → TraceScopeLayer → BlockingService (filter, deadline, endpoints)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::uri::InvalidUri,
    http::{StatusCode, Uri},
    middleware,
    routing::{any, get},
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tower::Layer;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{Pipeline, ServiceConfig};
use crate::http::handlers::{catch_all, health, AppState, BlockingEndpoints, Relay, HEALTH_PATH};
use crate::instrument::{
    AmbientTracer, BlockingService, NoopTracer, OutboundTimingLayer, ScopedTracer, SyncFilter,
    TraceScopeLayer, TraceTimingLayer,
};
use crate::security::edge_access_middleware;

/// Errors raised while building or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid upstream base url {url}: {source}")]
    InvalidUpstream {
        url: String,
        #[source]
        source: InvalidUri,
    },

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP server for the instrumented demo service.
pub struct HttpServer {
    router: Router,
    config: ServiceConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServiceConfig) -> Result<Self, ServerError> {
        let tracer: Arc<dyn AmbientTracer> = if config.instrumentation.ambient_tracer {
            Arc::new(ScopedTracer)
        } else {
            Arc::new(NoopTracer)
        };

        let relay = match &config.upstream.base_url {
            Some(url) => Some(Self::build_relay(&config, url, Arc::clone(&tracer))?),
            None => None,
        };
        if relay.is_some() && config.pipeline == Pipeline::Blocking {
            tracing::warn!("Upstream relay is not available on the blocking pipeline; requests will be echoed");
        }

        let router = Self::build_router(&config, tracer, relay);
        Ok(Self { router, config })
    }

    fn build_relay(
        config: &ServiceConfig,
        url: &str,
        tracer: Arc<dyn AmbientTracer>,
    ) -> Result<Relay, ServerError> {
        url.parse::<Uri>().map_err(|source| ServerError::InvalidUpstream {
            url: url.to_string(),
            source,
        })?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(
            config.upstream.connect_timeout_secs,
        )));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Relay {
            client: OutboundTimingLayer::new(tracer).layer(client),
            base_url: url.to_string(),
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(
        config: &ServiceConfig,
        tracer: Arc<dyn AmbientTracer>,
        relay: Option<Relay>,
    ) -> Router {
        let request_timeout = Duration::from_secs(config.timeouts.request_secs);

        let router = match config.pipeline {
            Pipeline::Async => {
                let mut router = Router::new()
                    .route(HEALTH_PATH, get(health))
                    .route("/", any(catch_all))
                    .route("/{*path}", any(catch_all))
                    .with_state(AppState {
                        relay,
                        body_limit: config.instrumentation.max_buffered_body_bytes,
                    })
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        request_timeout,
                    ));
                if config.edge.enabled {
                    router = router.layer(middleware::from_fn_with_state(
                        Arc::new(config.edge.clone()),
                        edge_access_middleware,
                    ));
                }
                router.layer(TraceTimingLayer::new(tracer, config.instrumentation.clone()))
            }
            Pipeline::Blocking => {
                let endpoints = BlockingEndpoints {
                    edge: config.edge.enabled.then(|| config.edge.clone()),
                };
                let filter = SyncFilter::new(tracer, config.instrumentation.clone());
                // The deadline is enforced inside the service so a late
                // request still gets a stamped 408.
                Router::new().fallback_service(
                    BlockingService::new(filter, endpoints).with_timeout(request_timeout),
                )
            }
        };

        let router = if config.instrumentation.ambient_tracer {
            router.layer(TraceScopeLayer)
        } else {
            router
        };
        router.layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            pipeline = ?self.config.pipeline,
            edge_enabled = self.config.edge.enabled,
            upstream = self.config.upstream.base_url.as_deref().unwrap_or("none"),
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The fully layered router, for driving the service without a listener.
    pub fn into_router(self) -> Router {
        self.router
    }
}
