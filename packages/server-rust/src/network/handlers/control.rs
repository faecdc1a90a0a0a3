//! One handler per administrative verb.
//!
//! Every handler answers with a [`ControlReply`] envelope. Failures keep the
//! envelope and pick an HTTP status from the error kind, so `pulsectl` can
//! print the message whatever the status.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pulseha_core::messages::{
    ConfigUpdateRequest, ControlData, ControlReply, CreateRequest, GroupRequest,
    JoinClusterRequest, NetworkRequest, PromoteRequest, RemoveRequest,
};

use super::AppState;
use crate::error::{DaemonError, DaemonResult};

pub type ControlResult = Result<Json<ControlReply>, DaemonError>;

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        (status_for(&self), Json(self.to_control_reply())).into_response()
    }
}

/// HTTP status for a failed verb.
#[must_use]
pub const fn status_for(err: &DaemonError) -> StatusCode {
    match err {
        DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::Conflict(_) | DaemonError::AlreadyInCluster => StatusCode::CONFLICT,
        DaemonError::ConfigInvalid(_) | DaemonError::ReadOnlyKey(_) | DaemonError::NotInCluster => {
            StatusCode::BAD_REQUEST
        }
        DaemonError::Unauthorized(_) | DaemonError::InvalidToken => StatusCode::FORBIDDEN,
        DaemonError::Unreachable(_) => StatusCode::BAD_GATEWAY,
        DaemonError::PluginMissing | DaemonError::MissingCa(_) | DaemonError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn ok(message: impl Into<String>) -> ControlResult {
    Ok(Json(ControlReply::ok(message)))
}

fn required<'a>(value: Option<&'a str>, what: &str) -> DaemonResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DaemonError::ConfigInvalid(format!("{what} is required")))
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

pub async fn create_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> ControlResult {
    let token = state.daemon.create(request).await?;
    Ok(Json(ControlReply::with_data(
        "Cluster created",
        ControlData::Token { token },
    )))
}

pub async fn join_handler(
    State(state): State<AppState>,
    Json(request): Json<JoinClusterRequest>,
) -> ControlResult {
    state.daemon.join(request).await?;
    ok("Joined cluster")
}

pub async fn leave_handler(State(state): State<AppState>) -> ControlResult {
    state.daemon.leave().await?;
    ok("Left cluster")
}

pub async fn remove_handler(
    State(state): State<AppState>,
    Json(request): Json<RemoveRequest>,
) -> ControlResult {
    state.daemon.remove(&request.hostname).await?;
    ok(format!("{} removed from cluster", request.hostname))
}

pub async fn promote_handler(
    State(state): State<AppState>,
    Json(request): Json<PromoteRequest>,
) -> ControlResult {
    state.daemon.promote(&request.hostname).await?;
    ok(format!("{} is now active", request.hostname))
}

// ---------------------------------------------------------------------------
// Security and tuning
// ---------------------------------------------------------------------------

pub async fn token_handler(State(state): State<AppState>) -> ControlResult {
    let token = state.daemon.rotate_token().await?;
    Ok(Json(ControlReply::with_data(
        "Cluster token rotated",
        ControlData::Token { token },
    )))
}

pub async fn tls_handler(State(state): State<AppState>) -> ControlResult {
    state.daemon.reissue_certificates().await?;
    ok("Certificates re-issued")
}

pub async fn config_handler(
    State(state): State<AppState>,
    Json(request): Json<ConfigUpdateRequest>,
) -> ControlResult {
    state
        .daemon
        .update_config(&request.key, &request.value)
        .await?;
    ok(format!("{} updated", request.key))
}

pub async fn network_handler(
    State(state): State<AppState>,
    Json(request): Json<NetworkRequest>,
) -> ControlResult {
    if state.daemon.network(&request.action).await? {
        ok("Floating IPs re-synced")
    } else {
        ok("Not the active member; nothing to re-sync")
    }
}

pub async fn reload_handler(State(state): State<AppState>) -> ControlResult {
    state.daemon.reload().await?;
    ok("Configuration reloaded")
}

pub async fn status_handler(State(state): State<AppState>) -> ControlResult {
    let members = state.daemon.status()?;
    Ok(Json(ControlReply::with_data(
        "",
        ControlData::Status { members },
    )))
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

pub async fn group_new_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = state.daemon.group_new(request.name.as_deref()).await?;
    ok(format!("Group {name} created"))
}

pub async fn group_delete_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = required(request.name.as_deref(), "group name")?;
    state.daemon.group_delete(name).await?;
    ok(format!("Group {name} deleted"))
}

pub async fn group_add_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = required(request.name.as_deref(), "group name")?;
    let added = state.daemon.group_add(name, &request.ips).await?;
    ok(format!("Added {} to {name}", added.join(", ")))
}

pub async fn group_remove_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = required(request.name.as_deref(), "group name")?;
    let removed = state.daemon.group_remove(name, &request.ips).await?;
    ok(format!("Removed {} from {name}", removed.join(", ")))
}

pub async fn group_assign_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = required(request.name.as_deref(), "group name")?;
    let iface = required(request.iface.as_deref(), "interface")?;
    state
        .daemon
        .group_assign(name, request.node.as_deref(), iface)
        .await?;
    ok(format!("{name} assigned to {iface}"))
}

pub async fn group_unassign_handler(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ControlResult {
    let name = required(request.name.as_deref(), "group name")?;
    let iface = required(request.iface.as_deref(), "interface")?;
    state
        .daemon
        .group_unassign(name, request.node.as_deref(), iface)
        .await?;
    ok(format!("{name} unassigned from {iface}"))
}

pub async fn group_list_handler(State(state): State<AppState>) -> ControlResult {
    let listing = state.daemon.group_list()?;
    Ok(Json(ControlReply::with_data("", ControlData::Groups(listing))))
}
