//! Device CRUD + enrollment pipeline (spec §6 `/api/devices*`).
//!
//! Enrollment is a narrow two-step handshake: `enroll` issues a six-digit
//! code cached at `enroll:<code>` (spec §3, TTL 600s), `activate` claims it
//! and upserts the device record before issuing a device-scoped bearer
//! token the device uses to open its `/ws` connection.

use crate::auth_ctx::authenticate;
use crate::rate_limit;
use crate::respond::ApiResult;
use crate::state::SharedState;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use gpsfleet_core::auth::TokenCodec;
use gpsfleet_core::cache::{keys, EphemeralStore, ENROLL_TTL};
use gpsfleet_core::model::Device;
use gpsfleet_core::store::EntityStore;
use gpsfleet_core::AppError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub platform: String,
    pub app_version: String,
    pub label: Option<String>,
}

pub async fn register(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<RegisterDeviceRequest>,
) -> ApiResult<Json<Device>> {
    let ctx = authenticate(&state, &headers)?;
    let existing_owner = state.store.get_device(&body.device_id).await?.map(|d| d.owner_user_id);
    if let Some(owner) = existing_owner {
        ctx.require_owner_or_admin(owner)?;
    }
    let device = Device {
        device_id: body.device_id,
        owner_user_id: ctx.user_id,
        platform: body.platform,
        app_version: body.app_version,
        label: body.label,
        assigned_route_id: None,
        last_seen_at: Utc::now(),
        last_ip: None,
        is_connected: false,
    };
    let device = state.store.upsert_device(device).await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub label: Option<String>,
    pub requested_device_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub code: String,
    pub expires_in_seconds: u64,
}

pub async fn enroll(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<EnrollRequest>,
) -> ApiResult<Json<EnrollResponse>> {
    let ctx = authenticate(&state, &headers)?;
    let code = generate_enroll_code();
    state
        .cache
        .set(
            &keys::enroll(&code),
            serde_json::json!({
                "userId": ctx.user_id,
                "label": body.label,
                "requestedDeviceId": body.requested_device_id,
            }),
            Some(ENROLL_TTL),
        )
        .await;
    Ok(Json(EnrollResponse {
        code,
        expires_in_seconds: ENROLL_TTL.as_secs(),
    }))
}

fn generate_enroll_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub code: String,
    pub device_id: Option<String>,
    pub platform: String,
    pub app_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub device_token: String,
    pub device_id: String,
}

pub async fn activate(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ActivateRequest>,
) -> ApiResult<Json<ActivateResponse>> {
    rate_limit::check(
        &state,
        "activate",
        &addr.ip().to_string(),
        state.config.rate_limit.activate_max,
        state.config.rate_limit.window_s,
    )
    .await?;

    let entry = state
        .cache
        .get(&keys::enroll(&body.code))
        .await
        .ok_or_else(|| AppError::NotFound("enroll code".into()))?;
    state.cache.delete(&keys::enroll(&body.code)).await;

    let owner_user_id: Uuid = entry
        .get("userId")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AppError::Internal("enroll entry missing userId".into()))?;
    let label = entry.get("label").and_then(|v| v.as_str()).map(|s| s.to_string());
    let requested_device_id = entry
        .get("requestedDeviceId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let device_id = body
        .device_id
        .clone()
        .or(requested_device_id)
        .unwrap_or_else(|| format!("dev-{}", Uuid::new_v4()));

    if state.store.get_device(&device_id).await?.is_some() {
        return Err(AppError::Conflict("device already enrolled".into()).into());
    }

    let device = Device {
        device_id: device_id.clone(),
        owner_user_id,
        platform: body.platform.clone(),
        app_version: body.app_version.clone(),
        label,
        assigned_route_id: None,
        last_seen_at: Utc::now(),
        last_ip: None,
        is_connected: false,
    };
    state.store.upsert_device(device).await?;
    let device_token = state.tokens.issue_device_token(&device_id)?;

    Ok(Json(ActivateResponse { device_token, device_id }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDevicesQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub active_within_seconds: Option<i64>,
}

pub async fn list(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<ListDevicesQuery>,
) -> ApiResult<Json<Vec<Device>>> {
    authenticate(&state, &headers)?;
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(20).clamp(1, 200);
    let mut devices = state.store.list_devices(page, limit).await?;
    if let Some(secs) = q.active_within_seconds {
        let cutoff = Utc::now() - chrono::Duration::seconds(secs);
        devices.retain(|d| d.last_seen_at >= cutoff);
    }
    Ok(Json(devices))
}

pub async fn get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Device>> {
    authenticate(&state, &headers)?;
    let device = state
        .store
        .get_device(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound("device".into()))?;
    Ok(Json(device))
}

pub async fn delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResult<StatusCode> {
    let ctx = authenticate(&state, &headers)?;
    let device = state
        .store
        .get_device(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound("device".into()))?;
    ctx.require_owner_or_admin(device.owner_user_id)?;

    state.scheduler.stop(&device_id).await.ok();
    state.registry.drop_device(&device_id).await;
    let existed = state.store.delete_device(&device_id).await?;
    if !existed {
        return Err(AppError::NotFound("device".into()).into());
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRouteRequest {
    pub route_id: Uuid,
}

pub async fn assign_route(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(body): Json<AssignRouteRequest>,
) -> ApiResult<Json<Device>> {
    let ctx = authenticate(&state, &headers)?;
    let device = state
        .store
        .get_device(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound("device".into()))?;
    ctx.require_owner_or_admin(device.owner_user_id)?;

    state.control.assign_route(&device_id, body.route_id).await?;
    let device = state
        .store
        .get_device(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound("device".into()))?;
    Ok(Json(device))
}
