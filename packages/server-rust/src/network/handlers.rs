//! Status and health endpoint handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::lifecycle::LifecycleController;
use crate::registry::ModuleRegistry;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    /// The coordinator's lifecycle controller.
    pub lifecycle: Arc<LifecycleController>,
    /// The module registry, for module counts.
    pub registry: Arc<ModuleRegistry>,
    /// Display name of this coordinator.
    pub service_name: String,
    /// Process start time, for uptime reporting.
    pub start_time: Instant,
}

/// Root route: service name and crate version.
pub async fn root_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Detailed health JSON.
///
/// Always returns 200 -- the `state` field tells monitoring tools whether
/// the coordinator is actually serving, which distinguishes "up but
/// waiting for a persistence module" from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.lifecycle.state().as_str(),
        "modules": state.registry.len(),
        "persistence": state.registry.has_persistence_module(),
        "inFlight": state.lifecycle.in_flight_count(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe -- always 200. A failed liveness probe restarts the
/// process, so this only checks that the process responds at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe -- 200 only while `Running`.
///
/// Startup (including the wait for a persistence module), draining, and
/// stopped states all report 503 so no traffic is routed here.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lifecycle.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use datafeed_core::{ModuleKind, RegisterRequest};

    use super::*;
    use crate::lifecycle::LifecycleState;
    use crate::storage::MemoryDocumentStore;

    fn test_state() -> AppState {
        AppState {
            lifecycle: Arc::new(LifecycleController::new()),
            registry: Arc::new(ModuleRegistry::new(
                Arc::new(MemoryDocumentStore::new()),
                "modules",
            )),
            service_name: "test-orchestrator".to_string(),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn root_reports_name_and_version() {
        let response = root_handler(State(test_state())).await;
        assert_eq!(response.0["name"], "test-orchestrator");
        assert_eq!(response.0["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn health_reports_all_fields() {
        let state = test_state();
        state.lifecycle.advance(LifecycleState::Running);

        let response = health_handler(State(state)).await;
        let body = response.0;
        assert_eq!(body["state"], "running");
        assert_eq!(body["modules"], 0);
        assert_eq!(body["persistence"], false);
        assert_eq!(body["inFlight"], 0);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_persistence_availability() {
        let state = test_state();
        state
            .registry
            .register(RegisterRequest {
                kind: Some(ModuleKind::Persistence),
                ..RegisterRequest::for_service("archive")
            })
            .await
            .unwrap();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["modules"], 1);
        assert_eq!(response.0["persistence"], true);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_tracks_the_lifecycle() {
        let state = test_state();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.lifecycle.advance(LifecycleState::AwaitingPersistenceModule);
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.lifecycle.advance(LifecycleState::Running);
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.lifecycle.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
