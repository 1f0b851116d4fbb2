use axum::{
    extract::{Path, State},
    Json,
};
use plinth_core::{AppState, CoreError};
use plinth_models::{ControlCommand, StreamStatus};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

/// Start (or replace) the caller's stream over the given asset.
///
/// The client decides success by inspecting `is_active`/`rtsp_url`, so
/// capacity and launch failures come back as a 200 with a non-active body
/// rather than a transport error.
pub async fn start_stream(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(asset_id): Path<i64>,
) -> Result<Json<StreamStatus>, ApiError> {
    match state.service.start_stream(auth.user_id, asset_id).await {
        Ok(status) => Ok(Json(status)),
        Err(
            e @ (CoreError::ResourceExhausted
            | CoreError::LaunchFailed(_)
            | CoreError::WorkerNotReady),
        ) => {
            tracing::warn!(
                user_id = auth.user_id,
                asset_id,
                error = %e,
                "stream failed to start"
            );
            Ok(Json(StreamStatus::inactive()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Stop the caller's current stream. A stop with nothing running is a
/// successful no-op, mirrored in the status field.
pub async fn stop_stream(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let stopped = state.service.stop_stream(auth.user_id).await;
    let status = if stopped { "stopped" } else { "no_active_session" };
    Ok(Json(json!({ "status": status })))
}

/// Forward one camera-control edge to the caller's worker.
///
/// A command against a missing or dead session is acknowledged as
/// rejected (still 200) — held-button clients retransmit edges around
/// teardown and must not treat that as a transport failure. A malformed
/// action/direction pair is a client bug and gets a 400.
pub async fn send_control(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(command): Json<ControlCommand>,
) -> Result<Json<Value>, ApiError> {
    match state.service.send_control(auth.user_id, command) {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(CoreError::SessionNotActive | CoreError::NotFound) => {
            Ok(Json(json!({ "status": "rejected", "detail": "no active session" })))
        }
        Err(CoreError::Worker(detail)) => {
            tracing::warn!(user_id = auth.user_id, detail, "control dropped");
            Ok(Json(json!({ "status": "rejected", "detail": "control backlog" })))
        }
        Err(e) => Err(e.into()),
    }
}

/// Current stream status for the caller; polling this doubles as a
/// keepalive against the idle sweep.
pub async fn stream_status(State(state): State<AppState>, auth: AuthUser) -> Json<StreamStatus> {
    Json(state.service.status(auth.user_id))
}
