//! Daemon health endpoints for `pulsectl` and local supervisors.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::DaemonPhase;

/// Returns the daemon phase and a short summary of its cluster state.
///
/// Always 200; the `phase` field says whether the daemon is actually serving.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let daemon = &state.daemon;
    let local_status = daemon
        .cluster()
        .members()
        .local()
        .map(|m| m.status().as_str());

    Json(json!({
        "phase": state.shutdown.phase().as_str(),
        "hostname": daemon.hostname(),
        "in_cluster": daemon.config().cluster_check(),
        "status": local_status,
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// 200 while running, 503 before start-up completes and once draining.
pub async fn liveness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.phase() == DaemonPhase::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
