//! Route-creation pipelines and CRUD (spec §6 `/api/routes*`). Each
//! `from-*` endpoint is a thin body-to-DTO mapping in front of
//! `ControlPlane`'s matching `create_route_from_*` method (spec §4.8),
//! which does the actual parse → safety-gate → persist → audit work.

use crate::auth_ctx::authenticate;
use crate::respond::{ok_json, ApiResult};
use crate::state::SharedState;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use gpsfleet_core::control::{PointInput, RouteCreation, WaypointInput};
use gpsfleet_core::model::{Route, RouteConfigOverrides, WaypointKind, WaypointMode};
use gpsfleet_core::store::EntityStore;
use gpsfleet_core::AppError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn created_response(creation: RouteCreation) -> Response {
    let status = if creation.created { StatusCode::CREATED } else { StatusCode::OK };
    ok_json(status, &creation.route)
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBody {
    pub lat: f64,
    pub lng: f64,
    pub dwell_seconds: Option<u32>,
    pub label: Option<String>,
}

impl From<PointBody> for PointInput {
    fn from(p: PointBody) -> Self {
        PointInput {
            lat: p.lat,
            lng: p.lng,
            dwell_seconds: p.dwell_seconds,
            label: p.label,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FromPointsRequest {
    pub name: String,
    pub points: Vec<PointBody>,
}

pub async fn from_points(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<FromPointsRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers)?;
    let points = body.points.into_iter().map(PointInput::from).collect();
    let creation = state.control.create_route_from_points(ctx.user_id, body.name, points).await?;
    Ok(created_response(creation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromGpxRequest {
    pub name: String,
    pub gpx_content: String,
}

pub async fn from_gpx(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<FromGpxRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers)?;
    let creation = state
        .control
        .create_route_from_gpx(ctx.user_id, body.name, &body.gpx_content)
        .await?;
    Ok(created_response(creation))
}

fn default_profile() -> String {
    "driving-car".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromAddressesRequest {
    pub origin_text: String,
    pub destination_text: String,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub point_spacing_meters: Option<f64>,
    pub wait_at_end_seconds: Option<u32>,
}

pub async fn from_addresses(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<FromAddressesRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers)?;
    let creation = state
        .control
        .create_route_from_addresses(
            ctx.user_id,
            &body.origin_text,
            &body.destination_text,
            &body.profile,
            body.point_spacing_meters,
            body.wait_at_end_seconds,
        )
        .await?;
    Ok(created_response(creation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromAddressesWithStopsRequest {
    pub stops: Vec<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub point_spacing_meters: Option<f64>,
}

pub async fn from_addresses_with_stops(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<FromAddressesWithStopsRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers)?;
    let creation = state
        .control
        .create_route_from_addresses_with_stops(ctx.user_id, body.stops, &body.profile, body.point_spacing_meters)
        .await?;
    Ok(created_response(creation))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointBody {
    pub kind: WaypointKind,
    pub mode: WaypointMode,
    pub text: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    #[serde(default)]
    pub dwell_seconds: u32,
    pub label: Option<String>,
}

impl From<WaypointBody> for WaypointInput {
    fn from(w: WaypointBody) -> Self {
        WaypointInput {
            kind: w.kind,
            mode: w.mode,
            text: w.text,
            lat: w.lat,
            lng: w.lng,
            dwell_seconds: w.dwell_seconds,
            label: w.label,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FromWaypointsRequest {
    pub waypoints: Vec<WaypointBody>,
    #[serde(default = "default_profile")]
    pub profile: String,
    pub point_spacing_meters: Option<f64>,
}

pub async fn from_waypoints(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<FromWaypointsRequest>,
) -> ApiResult<Response> {
    let ctx = authenticate(&state, &headers)?;
    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let canonical_payload = serde_json::to_vec(&body).map_err(|e| AppError::Internal(e.to_string()))?;
    let profile = body.profile.clone();
    let point_spacing = body.point_spacing_meters;
    let waypoints = body.waypoints.into_iter().map(WaypointInput::from).collect();

    let creation = state
        .control
        .create_route_from_waypoints(ctx.user_id, waypoints, &profile, point_spacing, idempotency_key, &canonical_payload)
        .await?;
    Ok(created_response(creation))
}

pub async fn list(State(state): State<SharedState>, headers: HeaderMap) -> ApiResult<Json<Vec<Route>>> {
    let ctx = authenticate(&state, &headers)?;
    let owner = if ctx.is_admin() { None } else { Some(ctx.user_id) };
    let routes = state.store.list_routes(owner).await?;
    Ok(Json(routes))
}

pub async fn get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Route>> {
    let ctx = authenticate(&state, &headers)?;
    let route = state.store.get_route(id).await?.ok_or_else(|| AppError::NotFound("route".into()))?;
    ctx.require_owner_or_admin(route.owner_user_id)?;
    Ok(Json(route))
}

pub async fn update_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(overrides): Json<RouteConfigOverrides>,
) -> ApiResult<Json<Route>> {
    let ctx = authenticate(&state, &headers)?;
    let route = state.store.get_route(id).await?.ok_or_else(|| AppError::NotFound("route".into()))?;
    ctx.require_owner_or_admin(route.owner_user_id)?;
    let updated = state.control.update_route_config(id, overrides).await?;
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let ctx = authenticate(&state, &headers)?;
    let route = state.store.get_route(id).await?.ok_or_else(|| AppError::NotFound("route".into()))?;
    ctx.require_owner_or_admin(route.owner_user_id)?;
    let existed = state.control.delete_route(id).await?;
    if !existed {
        return Err(AppError::NotFound("route".into()).into());
    }
    Ok(StatusCode::OK)
}
