//! HTTP status endpoints with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown future fires. The
//! routes expose the coordinator's lifecycle state for orchestrators and
//! monitoring: readiness goes green only once the coordinator is
//! `Running` (which implies a persistence module is registered).

pub mod handlers;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{Method, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::HttpConfig;
use crate::lifecycle::LifecycleController;
use crate::registry::ModuleRegistry;

use handlers::{health_handler, liveness_handler, readiness_handler, root_handler};

pub use handlers::AppState;

/// The composed Tower layer stack applied to all routes, outermost last:
/// trace, then CORS, then the request timeout.
type HttpLayers = tower::layer::util::Stack<
    TimeoutLayer,
    tower::layer::util::Stack<
        CorsLayer,
        tower::layer::util::Stack<
            TraceLayer<
                tower_http::classify::SharedClassifier<
                    tower_http::classify::ServerErrorsAsFailures,
                >,
            >,
            tower::layer::util::Identity,
        >,
    >,
>;

/// Serves the status/health routes for one coordinator.
pub struct StatusServer {
    config: HttpConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl StatusServer {
    /// Creates the server without binding any port.
    #[must_use]
    pub fn new(
        config: HttpConfig,
        lifecycle: Arc<LifecycleController>,
        registry: Arc<ModuleRegistry>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            config,
            listener: None,
            state: AppState {
                lifecycle,
                registry,
                service_name: service_name.into(),
                start_time: Instant::now(),
            },
        }
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /` -- service name and version
    /// - `GET /health` -- detailed state JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe (200 only when `Running`)
    #[must_use]
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the TCP listener, returning the actual bound port (which may
    /// differ from the configured port when port 0 is used).
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!("status endpoint bound to {}:{}", self.config.host, port);
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error on fatal I/O failures.
    ///
    /// # Panics
    ///
    /// Panics when `start()` was not called first.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .expect("start() must be called before serve()");
        let router = self.build_router();

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Builds the Tower middleware stack from the HTTP configuration.
#[must_use]
pub fn build_http_layers(config: &HttpConfig) -> HttpLayers {
    ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .into_inner()
}

/// Builds the CORS layer: a wildcard `"*"` allows any origin, otherwise
/// each parseable origin joins an explicit allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;

    fn status_server() -> StatusServer {
        let registry = Arc::new(ModuleRegistry::new(
            Arc::new(MemoryDocumentStore::new()),
            "modules",
        ));
        StatusServer::new(
            HttpConfig::default(),
            Arc::new(LifecycleController::new()),
            registry,
            "test-orchestrator",
        )
    }

    #[test]
    fn new_does_not_bind() {
        let server = status_server();
        assert!(server.listener.is_none());
    }

    #[test]
    fn build_router_creates_router() {
        let server = status_server();
        let _router = server.build_router();
    }

    #[tokio::test]
    async fn start_binds_an_os_assigned_port() {
        let mut server = status_server();
        let port = server.start().await.expect("bind should succeed");
        assert!(port > 0);
        assert!(server.listener.is_some());
    }

    #[test]
    fn build_cors_layer_accepts_wildcard_and_lists() {
        let _any = build_cors_layer(&["*".to_string()]);
        let _list = build_cors_layer(&[
            "http://localhost:3000".to_string(),
            "https://example.com".to_string(),
        ]);
    }
}
