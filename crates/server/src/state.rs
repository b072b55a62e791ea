//! Shared application state, grounded in `ecto-muni/depot/dispatch`'s
//! `AppState` (`db`, `rovers`, `broadcast_tx`) generalized from "one Postgres
//! pool and one rover map" into "every collaborator an HTTP/WS handler
//! needs": the control plane, the raw scheduler/registry for status fan-out,
//! the entity/ephemeral stores for handlers that bypass the control plane
//! (auth, device CRUD), and the token codec for issuing/decoding bearer
//! tokens.

use gpsfleet_core::auth::JwtTokenCodec;
use gpsfleet_core::cache::EphemeralStore;
use gpsfleet_core::config::AppConfig;
use gpsfleet_core::registry::SessionRegistry;
use gpsfleet_core::routing::RoutingService;
use gpsfleet_core::scheduler::StreamScheduler;
use gpsfleet_core::store::EntityStore;
use gpsfleet_core::ControlPlane;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Broadcast payload fanned out to every connected socket, filtered by role
/// in the WS handler (spec §4.4 "Broadcast").
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

pub struct AppState {
    pub control: ControlPlane,
    pub scheduler: Arc<StreamScheduler>,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn EntityStore>,
    pub cache: Arc<dyn EphemeralStore>,
    pub routing: Arc<dyn RoutingService>,
    pub tokens: Arc<JwtTokenCodec>,
    pub config: AppConfig,
    pub broadcast_tx: broadcast::Sender<BroadcastEvent>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn broadcast(&self, event_type: &str, payload: serde_json::Value) {
        let _ = self.broadcast_tx.send(BroadcastEvent {
            event_type: event_type.to_string(),
            payload,
        });
    }
}
