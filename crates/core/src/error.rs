//! Error taxonomy shared by every component (spec §7).
//!
//! Components never throw ad hoc strings; they return `AppError` so the
//! transport layer (HTTP status, WS close code) can be derived mechanically
//! in one place instead of re-deriving it per handler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("forbidden")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid route geometry: {0}")]
    InvalidRouteGeometry(String),

    #[error("invalid route spikes: {0}")]
    InvalidRouteSpikes(String),

    #[error("device not connected")]
    DeviceNotConnected,

    #[error("anti-teleport jump detected")]
    AntiTeleportJump,

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Coarse category name, used for audit entries and metrics counters.
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::AuthRequired => "auth_required",
            AppError::AuthFailed => "auth_failed",
            AppError::Forbidden => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::UpstreamUnavailable(_) => "upstream_unavailable",
            AppError::InvalidRouteGeometry(_) => "invalid_route_geometry",
            AppError::InvalidRouteSpikes(_) => "invalid_route_spikes",
            AppError::DeviceNotConnected => "device_not_connected",
            AppError::AntiTeleportJump => "anti_teleport_jump",
            AppError::BadArgument(_) => "bad_argument",
            AppError::Internal(_) => "internal",
        }
    }

    /// WebSocket close code per spec §4.4 / §6, for the subset of variants
    /// that can occur during the upgrade/auth path.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            AppError::AuthRequired | AppError::AuthFailed => 4001,
            AppError::BadArgument(_) => 4003,
            AppError::NotFound(_) => 4004,
            _ => 4500,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
