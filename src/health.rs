//! Liveness and readiness HTTP endpoints: the document store and
//! connection tracker instead of any actor-system state.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::dispatcher::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    store: CheckStatus,
    connections: ConnectionHealthStatus,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    store: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthStatus {
    active_connections: usize,
    status: CheckStatus,
}

/// Should return 200 OK whenever the process is alive, regardless of
/// downstream health.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// 200 OK once the document store answers a trivial query; 503 otherwise.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let store_ready = check_store(&state).await;
    let status = if store_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (status, Json(ReadinessResponse { ready: store_ready, checks: ReadinessChecks { store: store_ready } }))
}

/// Detailed health: store connectivity plus live connection count.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store_healthy = check_store(&state).await;
    let store_status = if store_healthy { CheckStatus::Healthy } else { CheckStatus::Unhealthy };

    let active = state.connections.active_count();
    let connections_status = if active <= state.config.max_total_connections {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let overall_healthy = store_status == CheckStatus::Healthy && connections_status == CheckStatus::Healthy;
    let status = if overall_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                store: store_status,
                connections: ConnectionHealthStatus { active_connections: active, status: connections_status },
            },
        }),
    )
}

async fn check_store(state: &AppState) -> bool {
    // An empty-collection query is a cheap, always-valid probe of store
    // connectivity regardless of backend.
    state.store.get_doc_ids_by_query("rec___healthcheck").await.is_ok()
}
