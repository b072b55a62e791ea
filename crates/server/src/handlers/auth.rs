//! Username/password login (spec §6 `POST /api/auth/login`). Rate-limited
//! per caller IP (spec §3 `ratelimit:login:*`) ahead of the password check
//! so a brute-force attempt burns the window before it burns CPU on argon2.

use crate::rate_limit;
use crate::respond::ApiResult;
use crate::state::SharedState;
use axum::extract::{ConnectInfo, State};
use axum::Json;
use gpsfleet_core::auth::{verify_password, TokenCodec};
use gpsfleet_core::store::EntityStore;
use gpsfleet_core::AppError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: uuid::Uuid,
    pub role: gpsfleet_core::model::Role,
}

pub async fn login(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    rate_limit::check(
        &state,
        "login",
        &addr.ip().to_string(),
        state.config.rate_limit.login_max,
        state.config.rate_limit.window_s,
    )
    .await?;

    let user = state
        .store
        .get_user_by_username(&body.username)
        .await?
        .ok_or(AppError::AuthFailed)?;

    if !verify_password(&body.password, &user.password_hash) {
        return Err(AppError::AuthFailed.into());
    }

    let token = state.tokens.issue_user_token(user.id, user.role)?;
    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        role: user.role,
    }))
}
