//! Data model (spec §3). Plain serde structs; persistence is behind the
//! `EntityStore` trait in `store.rs` so these types carry no storage
//! concerns of their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub owner_user_id: Uuid,
    pub platform: String,
    pub app_version: String,
    pub label: Option<String>,
    pub assigned_route_id: Option<Uuid>,
    pub last_seen_at: DateTime<Utc>,
    pub last_ip: Option<String>,
    pub is_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSourceType {
    Points,
    Gpx,
    Ors,
    OrsStops,
    OrsWaypoints,
}

/// A pause reservation, part of `RouteConfig.pauses` (reserved per spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePause {
    pub after_point_index: usize,
    pub duration_ms: u64,
}

/// Structured config bag with the recognized keys of spec §3, plus an
/// opaque passthrough map so unknown keys (and the documented opaque ones:
/// `idempotencyKey`, `distanceM`, `durationS`) round-trip unchanged (spec
/// §9 "Dynamic config object").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default = "default_speed_kmh")]
    pub speed: f64,
    #[serde(default = "default_accuracy_m")]
    pub accuracy: f64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub r#loop: bool,
    #[serde(default)]
    pub pauses: Vec<RoutePause>,
    #[serde(flatten)]
    pub passthrough: BTreeMap<String, serde_json::Value>,
}

fn default_speed_kmh() -> f64 {
    30.0
}
fn default_accuracy_m() -> f64 {
    5.0
}
fn default_interval_ms() -> u64 {
    1000
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            speed: default_speed_kmh(),
            accuracy: default_accuracy_m(),
            interval_ms: default_interval_ms(),
            r#loop: false,
            pauses: Vec::new(),
            passthrough: BTreeMap::new(),
        }
    }
}

impl RouteConfig {
    /// Clamp `intervalMs` to `[100, 60000]` per spec §3.
    pub fn clamped(mut self) -> Self {
        self.interval_ms = self.interval_ms.clamp(100, 60_000);
        self
    }

    /// Overlay `overrides` on top of `self ▷ system defaults` per spec §4.5
    /// ("overrides ▷ route.config ▷ system defaults").
    pub fn overlay(&self, overrides: &RouteConfigOverrides) -> RouteConfig {
        let mut merged = self.clone();
        if let Some(speed) = overrides.speed {
            merged.speed = speed;
        }
        if let Some(accuracy) = overrides.accuracy {
            merged.accuracy = accuracy;
        }
        if let Some(interval_ms) = overrides.interval_ms {
            merged.interval_ms = interval_ms;
        }
        if let Some(l) = overrides.r#loop {
            merged.r#loop = l;
        }
        merged.clamped()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfigOverrides {
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    pub interval_ms: Option<u64>,
    pub r#loop: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub source_type: RouteSourceType,
    pub config: RouteConfig,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePoint {
    pub route_id: Uuid,
    pub seq: u32,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub accuracy: Option<f64>,
    pub dwell_seconds: u32,
}

impl RoutePoint {
    pub fn latlng(&self) -> crate::geo::LatLng {
        crate::geo::LatLng::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    Origin,
    Stop,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointMode {
    Address,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub route_id: Uuid,
    pub seq: u32,
    pub kind: WaypointKind,
    pub mode: WaypointMode,
    pub label: Option<String>,
    pub text: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub dwell_seconds: u32,
    pub point_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    Started,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: Uuid,
    pub device_id: String,
    pub route_id: Uuid,
    pub status: StreamStatus,
    pub speed: f64,
    pub r#loop: bool,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub user_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
