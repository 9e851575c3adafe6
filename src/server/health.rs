//! Liveness and dependency health endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::json;

use super::AppState;
use crate::store::NotificationStore;
use crate::types::NotificationId;

/// `GET /health` - bare liveness for load balancers.
pub async fn liveness_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// `GET /v1/health` - dependency health.
///
/// Probes the store with a cheap read and reports queue depth. Returns 503
/// when a dependency fails its probe.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let store_ok = state
        .store()
        .find_by_id(NotificationId::generate())
        .await
        .is_ok();
    let queue_depth = state.queue().depth().await;
    let dead_letters = state.queue().dead_letters().await.len();

    let healthy = store_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "components": {
                "store": if store_ok { "ok" } else { "failed" },
                "queue": { "status": "ok", "depth": queue_depth, "dead_letters": dead_letters },
            },
        })),
    )
}
