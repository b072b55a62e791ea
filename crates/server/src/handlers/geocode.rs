//! Forward-geocoding autocomplete (spec §6 `/api/geocode/autocomplete`), a
//! thin pass-through to the configured `RoutingService`. The cache-or-fetch
//! dance (spec §3 `geocode:*` / `autocomplete:*` TTLs) lives inside the
//! routing service implementation, not here.

use crate::auth_ctx::authenticate;
use crate::respond::ApiResult;
use crate::state::SharedState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use gpsfleet_core::routing::GeocodeHit;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AutocompleteQuery {
    pub q: String,
    pub limit: Option<u32>,
    pub country: Option<String>,
}

pub async fn autocomplete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(q): Query<AutocompleteQuery>,
) -> ApiResult<Json<Vec<GeocodeHit>>> {
    authenticate(&state, &headers)?;
    let limit = q.limit.unwrap_or(5).clamp(1, 20);
    let hits = state.routing.autocomplete(&q.q, limit, q.country.as_deref()).await?;
    Ok(Json(hits))
}
