//! Maps `AppError` onto the HTTP surface's `{success:false, error, details?}`
//! error shape and status codes (spec §7), and a small `ApiResult` helper so
//! handlers can return `AppResult<Json<T>>`-shaped values directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use gpsfleet_core::AppError;
use serde_json::json;

pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = status_for(&self.0);
        let mut body = json!({
            "success": false,
            "error": self.0.to_string(),
        });
        if let Some(retry_after) = retry_after {
            body["details"] = json!({ "retryAfter": retry_after });
        }
        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", retry_after.into());
        }
        response
    }
}

fn status_for(err: &AppError) -> (StatusCode, Option<u64>) {
    match err {
        AppError::Validation(_) | AppError::BadArgument(_) => (StatusCode::BAD_REQUEST, None),
        AppError::NotFound(_) => (StatusCode::NOT_FOUND, None),
        AppError::AuthRequired | AppError::AuthFailed => (StatusCode::UNAUTHORIZED, None),
        AppError::Forbidden => (StatusCode::FORBIDDEN, None),
        AppError::Conflict(_) => (StatusCode::CONFLICT, None),
        AppError::RateLimited { retry_after_s } => (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_s)),
        AppError::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, None),
        AppError::InvalidRouteGeometry(_) | AppError::InvalidRouteSpikes(_) => {
            (StatusCode::BAD_REQUEST, None)
        }
        AppError::DeviceNotConnected => (StatusCode::CONFLICT, None),
        AppError::AntiTeleportJump => (StatusCode::INTERNAL_SERVER_ERROR, None),
        AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Wraps a JSON body with an explicit success status (route-creation
/// handlers need 201 vs 200 depending on idempotency dedup).
pub fn ok_json<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    (status, Json(serde_json::json!(body))).into_response()
}
