//! GPS fleet telemetry simulation backend.
//!
//! Endpoints:
//! - Auth: POST /api/auth/login
//! - Devices: POST /api/devices, /api/devices/enroll, /api/devices/activate,
//!   GET /api/devices, GET/DELETE /api/devices/:id, POST /api/devices/:id/route
//! - Routes: POST /api/routes/from-points|from-gpx|from-addresses|
//!   from-addresses-with-stops|from-waypoints, GET/PUT/DELETE /api/routes/:id
//! - Stream control: POST /api/stream/{start,pause,resume,stop,skip-dwell,
//!   extend-dwell}, GET /api/stream/status/:deviceId, /api/stream/status,
//!   GET /api/stream/history/:deviceId
//! - Geocoding: GET /api/geocode/autocomplete
//! - WebSocket: /ws - devices connect here for simulated frames
//! - Health/metrics: GET /health, GET /metrics

mod auth_ctx;
mod handlers;
mod rate_limit;
mod respond;
mod state;
mod ws;

use axum::routing::{delete, get, post, put};
use axum::Router;
use gpsfleet_core::auth::{hash_password, JwtTokenCodec};
use gpsfleet_core::cache::InMemoryEphemeralStore;
use gpsfleet_core::config::AppConfig;
use gpsfleet_core::control::{ControlPlane, ControlPlaneConfig};
use gpsfleet_core::model::{Role, User};
use gpsfleet_core::registry::SessionRegistry;
use gpsfleet_core::routing::{OrsRoutingService, RoutingService};
use gpsfleet_core::scheduler::StreamScheduler;
use gpsfleet_core::store::{EntityStore, InMemoryEntityStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

use state::{AppState, SharedState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpsfleet_server=info,gpsfleet_core=info".into()),
        )
        .init();

    let config = AppConfig::from_env();

    let store: Arc<dyn EntityStore> = InMemoryEntityStore::new();
    let cache = InMemoryEphemeralStore::new();
    let registry = SessionRegistry::new(cache.clone(), Uuid::new_v4().to_string());
    let scheduler = StreamScheduler::new(store.clone(), cache.clone(), registry.clone(), config.stream.clone()).await;
    let routing: Arc<dyn RoutingService> = Arc::new(
        OrsRoutingService::new(config.ors_api_key.clone(), config.ors_api_url.clone(), cache.clone())
            .expect("failed to build routing client"),
    );
    let tokens = Arc::new(JwtTokenCodec::new(&config.jwt_secret, config.jwt_expires_in_s));

    let control_cfg = ControlPlaneConfig {
        safety_gate_enabled: config.route_safety_gate_enabled,
        safety_gate: config.safety_gate.clone(),
        default_point_spacing_m: config.ors_default_point_spacing_m,
        default_route_config: config.default_route_config.clone(),
    };
    let control = ControlPlane::new(
        store.clone(),
        cache.clone(),
        registry.clone(),
        scheduler.clone(),
        routing.clone(),
        control_cfg,
    );

    seed_default_admin(&store, &config).await;

    let reaped = scheduler.reap_stale_hot_state().await;
    if reaped > 0 {
        info!(count = reaped, "reaped stale hot stream state on startup");
    }

    let (broadcast_tx, _) = broadcast::channel(256);
    let shared: SharedState = Arc::new(AppState {
        control,
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        store,
        cache,
        routing,
        tokens,
        config: config.clone(),
        broadcast_tx,
    });

    let app = build_router(shared);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "gpsfletd listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await
        .expect("server error");
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/devices", post(handlers::devices::register))
        .route("/api/devices", get(handlers::devices::list))
        .route("/api/devices/enroll", post(handlers::devices::enroll))
        .route("/api/devices/activate", post(handlers::devices::activate))
        .route("/api/devices/{deviceId}", get(handlers::devices::get))
        .route("/api/devices/{deviceId}", delete(handlers::devices::delete))
        .route("/api/devices/{deviceId}/route", post(handlers::devices::assign_route))
        .route("/api/routes/from-points", post(handlers::routes::from_points))
        .route("/api/routes/from-gpx", post(handlers::routes::from_gpx))
        .route("/api/routes/from-addresses", post(handlers::routes::from_addresses))
        .route(
            "/api/routes/from-addresses-with-stops",
            post(handlers::routes::from_addresses_with_stops),
        )
        .route("/api/routes/from-waypoints", post(handlers::routes::from_waypoints))
        .route("/api/routes", get(handlers::routes::list))
        .route("/api/routes/{id}", get(handlers::routes::get))
        .route("/api/routes/{id}", put(handlers::routes::update_config))
        .route("/api/routes/{id}", delete(handlers::routes::delete))
        .route("/api/stream/start", post(handlers::stream::start))
        .route("/api/stream/pause", post(handlers::stream::pause))
        .route("/api/stream/resume", post(handlers::stream::resume))
        .route("/api/stream/stop", post(handlers::stream::stop))
        .route("/api/stream/skip-dwell", post(handlers::stream::skip_dwell))
        .route("/api/stream/extend-dwell", post(handlers::stream::extend_dwell))
        .route("/api/stream/status", get(handlers::stream::status_all))
        .route("/api/stream/status/{deviceId}", get(handlers::stream::status))
        .route("/api/stream/history/{deviceId}", get(handlers::stream::history))
        .route("/api/geocode/autocomplete", get(handlers::geocode::autocomplete))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(handlers::health::health))
        .route("/metrics", get(handlers::health::metrics))
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn seed_default_admin(store: &Arc<dyn EntityStore>, config: &AppConfig) {
    if store.get_user_by_username("admin").await.ok().flatten().is_some() {
        return;
    }
    let password_hash = match hash_password(&config.default_admin_password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to hash default admin password");
            return;
        }
    };
    let user = User {
        id: Uuid::new_v4(),
        username: "admin".to_string(),
        password_hash,
        role: Role::Admin,
    };
    if let Err(e) = store.upsert_user(user).await {
        tracing::error!(error = %e, "failed to seed default admin user");
    }
}

async fn shutdown_signal(scheduler: Arc<StreamScheduler>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down, stopping all active streams");
    scheduler.shutdown_all().await;
}
