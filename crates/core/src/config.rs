//! Configuration (ambient stack addition): one `AppConfig::from_env()`
//! reading every environment variable spec §6 names, with documented
//! defaults and clamps. Grounded in `hanibalsk-phone-manager-backend`'s
//! `dotenvy` + `std::env` pattern — no dedicated config crate, since the
//! variable set is flat and every value has a sensible default.

use crate::backpressure::BackpressureConfig;
use crate::model::RouteConfig;
use crate::safety::SafetyGateConfig;
use crate::scheduler::SchedulerDefaults;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub is_dev: bool,

    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expires_in_s: i64,
    pub default_admin_password: String,

    pub allowed_origins: Vec<String>,
    pub ws_auth_ttl: Duration,
    pub ws_conn_ttl: Duration,

    pub stream: SchedulerDefaults,
    /// Config seeded for routes created with no explicit speed/accuracy/
    /// interval/loop (`from-points`, `from-gpx`), from `STREAM_DEFAULT_*`
    /// (spec §6 environment table).
    pub default_route_config: RouteConfig,

    pub route_safety_gate_enabled: bool,
    pub safety_gate: SafetyGateConfig,

    pub ors_api_key: String,
    pub ors_api_url: String,
    pub ors_geocoding_cache_ttl_s: u64,
    pub ors_default_point_spacing_m: f64,

    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub addresses_max: u32,
    pub window_s: u64,
    pub login_max: u32,
    pub activate_max: u32,
    pub ip_window_s: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            addresses_max: 20,
            window_s: 60,
            login_max: 10,
            activate_max: 10,
            ip_window_s: 60,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        // Best-effort: missing .env is not an error in production.
        let _ = dotenvy::dotenv();

        let is_dev = env_string("NODE_ENV", "development") != "production";
        let tick_clamp_min_ms = env_parsed("STREAM_TICK_CLAMP_MIN_MS", 200u64);
        let tick_clamp_max_ms = env_parsed("STREAM_TICK_CLAMP_MAX_MS", 2000u64).max(tick_clamp_min_ms);

        Self {
            port: env_parsed("PORT", 8080u16),
            is_dev,

            database_url: env_opt_string("DATABASE_URL"),
            redis_url: env_opt_string("REDIS_URL"),
            jwt_secret: env_string("JWT_SECRET", "dev-insecure-secret-change-me"),
            jwt_expires_in_s: env_parsed("JWT_EXPIRES_IN", 86_400i64),
            default_admin_password: env_string("DEFAULT_ADMIN_PASSWORD", "admin"),

            allowed_origins: env_csv("ALLOWED_ORIGINS", &["*"]),
            ws_auth_ttl: Duration::from_secs(env_parsed("WS_AUTH_TTL", 900u64)),
            ws_conn_ttl: Duration::from_secs(env_parsed("WS_CONN_TTL", 120u64)),

            stream: SchedulerDefaults {
                tick_clamp_min_ms,
                tick_clamp_max_ms,
                distance_engine: env_bool("STREAM_DISTANCE_ENGINE", true),
                backpressure: BackpressureConfig {
                    enabled: env_bool("STREAM_WS_BACKPRESSURE_ENABLED", true),
                    ws_max_bytes: env_parsed("STREAM_WS_BUFFERED_MAX_BYTES", 262_144usize),
                    tcp_max_bytes: env_parsed("STREAM_WS_TCP_MAX_BYTES", 524_288usize),
                    strikes_to_pause: env_parsed("STREAM_WS_PRESSURE_STRIKES_TO_PAUSE", 10u32),
                    pressure_window_ms: env_parsed("STREAM_WS_PRESSURE_WINDOW_MS", 15_000u64),
                },
            },
            default_route_config: RouteConfig {
                speed: env_parsed("STREAM_DEFAULT_SPEED", 30.0f64),
                accuracy: env_parsed("STREAM_DEFAULT_ACCURACY", 5.0f64),
                interval_ms: env_parsed("STREAM_TICK_MS", 1000u64),
                r#loop: env_bool("STREAM_DEFAULT_LOOP", false),
                ..RouteConfig::default()
            }
            .clamped(),

            route_safety_gate_enabled: env_bool("ROUTE_SAFETY_GATE", true),
            safety_gate: SafetyGateConfig {
                tolerance_meters: env_parsed("ROUTE_SIMPLIFY_METERS", 5.0f64),
                step_meters: env_parsed("ROUTE_RESAMPLE_METERS", 5.0f64),
                max_segment_meters: env_parsed("ROUTE_MAX_SEGMENT_METERS", 200.0f64),
                min_total_meters: env_parsed("ROUTE_MIN_TOTAL_METERS", 50.0f64),
                ..SafetyGateConfig::default()
            },

            ors_api_key: env_string("ORS_API_KEY", ""),
            ors_api_url: env_string("ORS_API_URL", "https://api.openrouteservice.org"),
            ors_geocoding_cache_ttl_s: env_parsed("ORS_GEOCODING_CACHE_TTL", 86_400u64),
            ors_default_point_spacing_m: env_parsed("ORS_DEFAULT_POINT_SPACING", 25.0f64),

            rate_limit: RateLimitConfig {
                addresses_max: env_parsed("RATE_LIMIT_ADDRESSES", RateLimitConfig::default().addresses_max),
                window_s: env_parsed("RATE_LIMIT_WINDOW", RateLimitConfig::default().window_s),
                login_max: env_parsed("RATE_LIMIT_LOGIN_MAX", RateLimitConfig::default().login_max),
                activate_max: env_parsed("RATE_LIMIT_ACTIVATE_MAX", RateLimitConfig::default().activate_max),
                ip_window_s: env_parsed("RATE_LIMIT_IP_WINDOW", RateLimitConfig::default().ip_window_s),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_clamp_max_never_below_min() {
        std::env::set_var("STREAM_TICK_CLAMP_MIN_MS", "3000");
        std::env::set_var("STREAM_TICK_CLAMP_MAX_MS", "1000");
        let cfg = AppConfig::from_env();
        assert!(cfg.stream.tick_clamp_max_ms >= cfg.stream.tick_clamp_min_ms);
        std::env::remove_var("STREAM_TICK_CLAMP_MIN_MS");
        std::env::remove_var("STREAM_TICK_CLAMP_MAX_MS");
    }

    #[test]
    fn unset_booleans_fall_back_to_documented_defaults() {
        std::env::remove_var("STREAM_DISTANCE_ENGINE");
        let cfg = AppConfig::from_env();
        assert!(cfg.stream.distance_engine);
    }
}
