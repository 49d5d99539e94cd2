//! The suite's own REST surface. See spec §4.13.
//!
//! Bearer auth is enforced on every route except the liveness probe
//! (`GET /health`), which monitoring tools are expected to hit unauthenticated
//! the way a container orchestrator's liveness check does.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use suite_core::auth::verify_bearer;
use suite_core::context::ContextOptions;
use suite_core::diagnostics::system_snapshot;

use crate::boot::{sync_cycle, Suite};

#[derive(Clone)]
pub struct AppState {
    pub suite: Arc<Suite>,
    pub shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::predicate(|origin: &axum::http::HeaderValue, _| {
            let s = origin.to_str().unwrap_or("");
            s.starts_with("http://127.0.0.1:") || s.starts_with("http://localhost:")
        }))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/health", get(health))
        .route("/health/full", get(health_full))
        .route("/health/:module_id", get(health_module))
        .route("/context/preview", get(context_preview))
        .route("/sync/now", post(sync_now))
        .route("/modules", get(modules))
        .route("/shutdown", post(shutdown))
        .layer(cors)
        .with_state(state)
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let header_value = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    verify_bearer(header_value, &state.suite.auth_token)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health_full(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    let suite = &state.suite;
    let now = chrono::Utc::now();
    let uptime_s = (now - suite.started_at).num_seconds().max(0);
    let modules: Vec<serde_json::Value> = suite
        .registry
        .snapshot()
        .into_iter()
        .map(|r| {
            let last_probe_age_s = r.last_probe_at.map(|t| (now - t).num_seconds()).unwrap_or(-1);
            serde_json::json!({
                "module_id": r.module_id,
                "state": r.state.to_string(),
                "port": r.assigned_port,
                "last_probe_age_s": last_probe_age_s,
            })
        })
        .collect();

    let cloud = match &suite.cloud_bridge {
        Some(bridge) => {
            let (last_sync_ts, ok) = bridge.last_sync_summary().map(|(ts, ok)| (Some(ts), ok)).unwrap_or((None, false));
            let latency_ms = bridge.health().await.ok();
            serde_json::json!({ "enabled": true, "last_sync_ts": last_sync_ts, "ok": ok, "latency_ms": latency_ms })
        }
        None => serde_json::json!({ "enabled": false }),
    };

    let ollama_like = suite.health.snapshot().get("ollama_like").map(|s| s.status.clone());
    let sys = system_snapshot(&suite.vector_store_path);

    let body = serde_json::json!({
        "ts": now.to_rfc3339(),
        "suite": { "version": env!("CARGO_PKG_VERSION"), "uptime_s": uptime_s },
        "modules": modules,
        "cloud": cloud,
        "ollama_like": ollama_like,
        "sys": { "disk_free_gb": sys.disk_free_gb, "ram_free_gb": sys.ram_free_gb },
        "vector_store": suite.config.effective().vector_store,
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn health_module(State(state): State<AppState>, headers: HeaderMap, Path(module_id): Path<String>) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    match state.suite.registry.get(&module_id) {
        Some(record) => (StatusCode::OK, Json(serde_json::to_value(record).unwrap_or_default())).into_response(),
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "module not found" }))).into_response(),
    }
}

#[derive(Deserialize)]
struct ContextPreviewParams {
    user: String,
    query: Option<String>,
}

async fn context_preview(State(state): State<AppState>, headers: HeaderMap, Query(params): Query<ContextPreviewParams>) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    let options = ContextOptions::defaults();
    let recent = state.suite.bus.recent(None, 20);
    let bundle = state.suite.context.build(&params.user, params.query.as_deref(), &options, recent).await;
    (StatusCode::OK, Json(bundle)).into_response()
}

async fn sync_now(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    let suite = &state.suite;
    match &suite.cloud_bridge {
        Some(bridge) => match sync_cycle(bridge, &suite.context, &suite.facts, &suite.bus).await {
            Ok(users_synced) => (StatusCode::OK, Json(serde_json::json!({ "ok": true, "users_synced": users_synced }))).into_response(),
            Err(e) => (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "ok": false, "error": e.to_string() }))).into_response(),
        },
        None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "cloud bridge not configured" }))).into_response(),
    }
}

async fn modules(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    let snapshot: Vec<_> = state.suite.registry.snapshot();
    (StatusCode::OK, Json(snapshot)).into_response()
}

async fn shutdown(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response();
    }
    let _ = state.shutdown_tx.send(()).await;
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "shutting_down": true }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashSet;
    use std::time::Duration;
    use suite_core::event_bus::EventBus;
    use suite_core::fact_store::FactStore;
    use suite_core::health::HealthMonitor;
    use suite_core::registry::ModuleRegistry;
    use suite_core::vector_index::FlatVectorIndex;
    use suite_core::ConfigStore;
    use tower::ServiceExt;

    #[test]
    fn authorized_rejects_missing_header() {
        // authorized() just delegates to verify_bearer, already covered by auth.rs's own tests;
        // this exercises the header-extraction plumbing specifically.
        let headers = HeaderMap::new();
        assert!(!verify_bearer(headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()), "t"));
    }

    fn test_suite(tmp: &std::path::Path) -> Suite {
        let config = Arc::new(ConfigStore::open(tmp.join("suite_config.json"), tmp.join("modules"), HashSet::new()).unwrap());
        let facts = Arc::new(FactStore::open_path(tmp.join("facts")).unwrap());
        let vector_index: Arc<dyn suite_core::VectorIndex> = Arc::new(FlatVectorIndex::new(tmp.join("vectors"), None));
        let bus = EventBus::new();
        let registry = Arc::new(ModuleRegistry::new(tmp.join("modules"), (5000, 5099), "test-token".to_string(), Arc::clone(&bus)));
        let health = HealthMonitor::new(Arc::clone(&registry), Duration::from_secs(30), Duration::from_secs(3), 4, 3, None);
        let context = Arc::new(suite_core::ContextGraph::new(Arc::clone(&facts), Some(Arc::clone(&vector_index)), None, Arc::clone(&registry), Arc::clone(&health), None));
        Suite {
            config,
            logger: std::sync::Mutex::new(None),
            facts,
            vector_index,
            bus,
            registry,
            health,
            cloud_bridge: None,
            context,
            auth_token: "test-token".to_string(),
            started_at: chrono::Utc::now(),
            grace_period: Duration::from_secs(5),
            vector_store_path: tmp.join("vectors"),
        }
    }

    #[tokio::test]
    async fn unauthenticated_liveness_probe_returns_ok_through_the_real_router() {
        let tmp = tempfile::tempdir().unwrap();
        let (shutdown_tx, _rx) = tokio::sync::mpsc::channel(1);
        let state = AppState { suite: Arc::new(test_suite(tmp.path())), shutdown_tx };
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_full_without_bearer_token_is_rejected_through_the_real_router() {
        let tmp = tempfile::tempdir().unwrap();
        let (shutdown_tx, _rx) = tokio::sync::mpsc::channel(1);
        let state = AppState { suite: Arc::new(test_suite(tmp.path())), shutdown_tx };
        let app = router(state);

        let response = app
            .oneshot(Request::builder().uri("/health/full").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
