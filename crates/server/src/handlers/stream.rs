//! Stream lifecycle control (spec §6 `/api/stream/*`), a thin body-to-call
//! mapping in front of `ControlPlane`'s facade over the Stream Scheduler
//! (spec §4.8).

use crate::auth_ctx::authenticate;
use crate::respond::ApiResult;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::Json;
use gpsfleet_core::model::{AuditEntry, RouteConfigOverrides};
use gpsfleet_core::scheduler::StreamStatusView;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub device_id: String,
    pub route_id: Uuid,
    #[serde(default)]
    pub overrides: RouteConfigOverrides,
}

pub async fn start(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<StartRequest>,
) -> ApiResult<Json<StreamStatusView>> {
    authenticate(&state, &headers)?;
    let view = state.control.start(&body.device_id, body.route_id, body.overrides).await?;
    state.broadcast(
        "STREAM_STARTED",
        serde_json::json!({"deviceId": body.device_id, "routeId": body.route_id}),
    );
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdBody {
    pub device_id: String,
}

pub async fn pause(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> ApiResult<Json<StreamStatusView>> {
    authenticate(&state, &headers)?;
    let view = state.control.pause(&body.device_id).await?;
    Ok(Json(view))
}

pub async fn resume(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> ApiResult<Json<StreamStatusView>> {
    authenticate(&state, &headers)?;
    let view = state.control.resume(&body.device_id).await?;
    Ok(Json(view))
}

pub async fn stop(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> ApiResult<Json<StreamStatusView>> {
    authenticate(&state, &headers)?;
    let view = state.control.stop(&body.device_id).await?;
    state.broadcast("STREAM_STOPPED", serde_json::json!({"deviceId": body.device_id}));
    Ok(Json(view))
}

pub async fn skip_dwell(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<DeviceIdBody>,
) -> ApiResult<axum::http::StatusCode> {
    authenticate(&state, &headers)?;
    state.control.skip_dwell(&body.device_id).await?;
    Ok(axum::http::StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendDwellRequest {
    pub device_id: String,
    pub seconds: u64,
}

pub async fn extend_dwell(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ExtendDwellRequest>,
) -> ApiResult<axum::http::StatusCode> {
    authenticate(&state, &headers)?;
    state.control.extend_dwell(&body.device_id, body.seconds).await?;
    Ok(axum::http::StatusCode::OK)
}

pub async fn status(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<Json<StreamStatusView>> {
    authenticate(&state, &headers)?;
    let view = state.control.status(&device_id).await?;
    Ok(Json(view))
}

pub async fn status_all(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
) -> ApiResult<Json<Vec<StreamStatusView>>> {
    authenticate(&state, &headers)?;
    Ok(Json(state.control.list_active().await))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Path(device_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    authenticate(&state, &headers)?;
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let entries = state.control.history(&device_id, limit).await?;
    Ok(Json(entries))
}
