//! Control plane (C10): the `start/pause/resume/stop/skipDwell/
//! extendDwell/status/listActive/history` facade over the Stream
//! Scheduler, plus the shared route-creation pipeline (spec §4.8): parse
//! → coordinate validate → route safety gate → persist → audit.
//!
//! Grounded in `ecto-muni/depot/dispatch`'s `AppState`-held-services
//! pattern, generalized from "one struct holding the rover map and DB
//! pool" into "one struct holding every collaborator the command handlers
//! need".

use crate::cache::EphemeralStore;
use crate::error::{AppError, AppResult};
use crate::geo::{resample, LatLng};
use crate::gpx::parse_gpx;
use crate::model::{
    Route, RouteConfig, RouteConfigOverrides, RoutePoint, RouteSourceType, Waypoint, WaypointKind,
    WaypointMode,
};
use crate::registry::SessionRegistry;
use crate::routing::RoutingService;
use crate::safety::{nearest_point_index, run_safety_gate, GatePoint, SafetyGateConfig};
use crate::scheduler::{ScheduleStatus, StreamScheduler, StreamStatusView};
use crate::store::EntityStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

const IDEMPOTENCY_WINDOW_S: i64 = 600;

pub struct ControlPlaneConfig {
    pub safety_gate_enabled: bool,
    pub safety_gate: SafetyGateConfig,
    pub default_point_spacing_m: f64,
    /// Seeded onto routes created with no explicit config (`from-points`,
    /// `from-gpx`) from `STREAM_DEFAULT_*` env vars.
    pub default_route_config: RouteConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            safety_gate_enabled: true,
            safety_gate: SafetyGateConfig::default(),
            default_point_spacing_m: 25.0,
            default_route_config: RouteConfig::default(),
        }
    }
}

pub struct ControlPlane {
    store: Arc<dyn EntityStore>,
    #[allow(dead_code)]
    cache: Arc<dyn EphemeralStore>,
    #[allow(dead_code)]
    registry: Arc<SessionRegistry>,
    scheduler: Arc<StreamScheduler>,
    routing: Arc<dyn RoutingService>,
    cfg: ControlPlaneConfig,
}

#[derive(Debug, Clone)]
pub struct PointInput {
    pub lat: f64,
    pub lng: f64,
    pub dwell_seconds: Option<u32>,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WaypointInput {
    pub kind: WaypointKind,
    pub mode: WaypointMode,
    pub text: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub dwell_seconds: u32,
    pub label: Option<String>,
}

/// Outcome of a route-creation call: `created=false` means the idempotency
/// check returned an existing route (spec §4.8, HTTP 200 instead of 201).
pub struct RouteCreation {
    pub route: Route,
    pub created: bool,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn EntityStore>,
        cache: Arc<dyn EphemeralStore>,
        registry: Arc<SessionRegistry>,
        scheduler: Arc<StreamScheduler>,
        routing: Arc<dyn RoutingService>,
        cfg: ControlPlaneConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            scheduler,
            routing,
            cfg,
        }
    }

    fn gate(&self, points: Vec<GatePoint>) -> AppResult<Vec<GatePoint>> {
        if self.cfg.safety_gate_enabled {
            run_safety_gate(&points, &self.cfg.safety_gate)
        } else if points.len() >= 2 {
            Ok(points)
        } else {
            Err(AppError::InvalidRouteGeometry(
                "fewer than 2 points".into(),
            ))
        }
    }

    async fn persist(
        &self,
        owner: Uuid,
        name: String,
        source_type: RouteSourceType,
        gated: Vec<GatePoint>,
        config: RouteConfig,
        waypoints: Vec<Waypoint>,
    ) -> AppResult<Route> {
        let route_id = Uuid::new_v4();
        let route = Route {
            id: route_id,
            owner_user_id: owner,
            name,
            source_type,
            config,
            created_at: Utc::now(),
        };
        let points: Vec<RoutePoint> = gated
            .into_iter()
            .enumerate()
            .map(|(i, p)| RoutePoint {
                route_id,
                seq: i as u32,
                lat: p.pos.lat,
                lng: p.pos.lng,
                speed: None,
                bearing: None,
                accuracy: None,
                dwell_seconds: p.dwell_seconds,
            })
            .collect();
        let route = self.store.create_route(route, points, waypoints).await?;
        self.store
            .append_audit(crate::model::AuditEntry {
                action: "route_created".into(),
                user_id: Some(owner),
                device_id: None,
                meta: serde_json::json!({"routeId": route_id, "sourceType": route.source_type}),
                created_at: Utc::now(),
            })
            .await
            .ok();
        Ok(route)
    }

    pub async fn create_route_from_points(
        &self,
        owner: Uuid,
        name: String,
        points: Vec<PointInput>,
    ) -> AppResult<RouteCreation> {
        let gate_points: Vec<GatePoint> = points
            .into_iter()
            .map(|p| GatePoint {
                pos: LatLng::new(p.lat, p.lng),
                dwell_seconds: p.dwell_seconds.unwrap_or(0),
                label: p.label,
            })
            .collect();
        let gated = self.gate(gate_points)?;
        let route = self
            .persist(owner, name, RouteSourceType::Points, gated, self.cfg.default_route_config.clone(), vec![])
            .await?;
        Ok(RouteCreation { route, created: true })
    }

    pub async fn create_route_from_gpx(
        &self,
        owner: Uuid,
        name: String,
        gpx_content: &str,
    ) -> AppResult<RouteCreation> {
        let parsed = parse_gpx(gpx_content);
        if parsed.points.len() < 2 {
            return Err(AppError::Validation(format!(
                "gpx produced fewer than 2 usable points ({} dropped as out of range)",
                parsed.dropped_out_of_range
            )));
        }
        let gate_points: Vec<GatePoint> = parsed.points.into_iter().map(GatePoint::plain).collect();
        let gated = self.gate(gate_points)?;
        let route = self
            .persist(owner, name, RouteSourceType::Gpx, gated, self.cfg.default_route_config.clone(), vec![])
            .await?;
        Ok(RouteCreation { route, created: true })
    }

    pub async fn create_route_from_addresses(
        &self,
        owner: Uuid,
        origin_text: &str,
        destination_text: &str,
        profile: &str,
        point_spacing_m: Option<f64>,
        wait_at_end_s: Option<u32>,
    ) -> AppResult<RouteCreation> {
        let origin = self.routing.geocode(origin_text).await?;
        let destination = self.routing.geocode(destination_text).await?;
        let directions = self
            .routing
            .directions(profile, &[origin.pos, destination.pos])
            .await?;
        let spacing = point_spacing_m.unwrap_or(self.cfg.default_point_spacing_m);
        let resampled = resample(&directions.points, spacing)?;

        let mut gate_points: Vec<GatePoint> = resampled.into_iter().map(GatePoint::plain).collect();
        if let Some(last) = gate_points.last_mut() {
            last.dwell_seconds = wait_at_end_s.unwrap_or(0);
            last.label = Some("destination".into());
        }
        if let Some(first) = gate_points.first_mut() {
            first.label.get_or_insert_with(|| "origin".into());
        }

        let gated = self.gate(gate_points)?;
        let plain: Vec<LatLng> = gated.iter().map(|p| p.pos).collect();
        let waypoints = vec![
            Waypoint {
                route_id: Uuid::nil(),
                seq: 0,
                kind: WaypointKind::Origin,
                mode: WaypointMode::Address,
                label: Some(origin.label.clone()),
                text: Some(origin_text.to_string()),
                lat: origin.pos.lat,
                lng: origin.pos.lng,
                dwell_seconds: 0,
                point_index: nearest_point_index(&plain, origin.pos),
            },
            Waypoint {
                route_id: Uuid::nil(),
                seq: 1,
                kind: WaypointKind::Destination,
                mode: WaypointMode::Address,
                label: Some(destination.label.clone()),
                text: Some(destination_text.to_string()),
                lat: destination.pos.lat,
                lng: destination.pos.lng,
                dwell_seconds: wait_at_end_s.unwrap_or(0),
                point_index: nearest_point_index(&plain, destination.pos),
            },
        ];

        let mut config = self.cfg.default_route_config.clone();
        config
            .passthrough
            .insert("distanceM".into(), serde_json::json!(directions.distance_m));
        config
            .passthrough
            .insert("durationS".into(), serde_json::json!(directions.duration_s));

        let route = self
            .persist(owner, format!("{origin_text} -> {destination_text}"), RouteSourceType::Ors, gated, config, waypoints)
            .await?;
        Ok(RouteCreation { route, created: true })
    }

    pub async fn create_route_from_addresses_with_stops(
        &self,
        owner: Uuid,
        stops: Vec<String>,
        profile: &str,
        point_spacing_m: Option<f64>,
    ) -> AppResult<RouteCreation> {
        if stops.len() < 2 {
            return Err(AppError::Validation("need at least 2 stops".into()));
        }
        let mut hits = Vec::with_capacity(stops.len());
        for stop in &stops {
            hits.push(self.routing.geocode(stop).await?);
        }
        let positions: Vec<LatLng> = hits.iter().map(|h| h.pos).collect();
        let directions = self.routing.directions(profile, &positions).await?;
        let spacing = point_spacing_m.unwrap_or(self.cfg.default_point_spacing_m);
        let resampled = resample(&directions.points, spacing)?;
        let gate_points: Vec<GatePoint> = resampled.into_iter().map(GatePoint::plain).collect();
        let mut gated = self.gate(gate_points)?;
        let plain: Vec<LatLng> = gated.iter().map(|p| p.pos).collect();

        let last_idx = hits.len() - 1;
        let waypoints: Vec<Waypoint> = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| Waypoint {
                route_id: Uuid::nil(),
                seq: i as u32,
                kind: if i == 0 {
                    WaypointKind::Origin
                } else if i == last_idx {
                    WaypointKind::Destination
                } else {
                    WaypointKind::Stop
                },
                mode: WaypointMode::Address,
                label: Some(hit.label.clone()),
                text: Some(stops[i].clone()),
                lat: hit.pos.lat,
                lng: hit.pos.lng,
                dwell_seconds: 0,
                point_index: nearest_point_index(&plain, hit.pos),
            })
            .collect();
        for w in &waypoints {
            if let Some(gp) = gated.get_mut(w.point_index) {
                gp.dwell_seconds = w.dwell_seconds;
            }
        }

        let mut config = self.cfg.default_route_config.clone();
        config
            .passthrough
            .insert("distanceM".into(), serde_json::json!(directions.distance_m));
        config
            .passthrough
            .insert("durationS".into(), serde_json::json!(directions.duration_s));

        let route = self
            .persist(owner, format!("{} stops", stops.len()), RouteSourceType::OrsStops, gated, config, waypoints)
            .await?;
        Ok(RouteCreation { route, created: true })
    }

    pub async fn create_route_from_waypoints(
        &self,
        owner: Uuid,
        waypoints_in: Vec<WaypointInput>,
        profile: &str,
        point_spacing_m: Option<f64>,
        client_idempotency_key: Option<String>,
        canonical_payload: &[u8],
    ) -> AppResult<RouteCreation> {
        let key = client_idempotency_key.unwrap_or_else(|| hex::encode(Sha256::digest(canonical_payload)));

        if let Some(existing) = self
            .store
            .find_recent_route_by_idempotency_key(owner, &key, IDEMPOTENCY_WINDOW_S)
            .await?
        {
            return Ok(RouteCreation { route: existing, created: false });
        }

        if waypoints_in.len() < 2 {
            return Err(AppError::Validation("need at least 2 waypoints".into()));
        }

        let mut resolved = Vec::with_capacity(waypoints_in.len());
        for w in &waypoints_in {
            let pos = match w.mode {
                WaypointMode::Address => {
                    let text = w
                        .text
                        .as_deref()
                        .ok_or_else(|| AppError::Validation("address waypoint missing text".into()))?;
                    self.routing.geocode(text).await?.pos
                }
                WaypointMode::Manual => {
                    let (lat, lng) = (
                        w.lat.ok_or_else(|| AppError::Validation("manual waypoint missing lat".into()))?,
                        w.lng.ok_or_else(|| AppError::Validation("manual waypoint missing lng".into()))?,
                    );
                    LatLng::new(lat, lng)
                }
            };
            resolved.push(pos);
        }

        let directions = self.routing.directions(profile, &resolved).await?;
        let spacing = point_spacing_m.unwrap_or(self.cfg.default_point_spacing_m);
        let resampled = resample(&directions.points, spacing)?;
        let gate_points: Vec<GatePoint> = resampled.into_iter().map(GatePoint::plain).collect();
        let mut gated = self.gate(gate_points)?;
        let plain: Vec<LatLng> = gated.iter().map(|p| p.pos).collect();

        let waypoints: Vec<Waypoint> = waypoints_in
            .iter()
            .zip(resolved.iter())
            .enumerate()
            .map(|(i, (w, pos))| Waypoint {
                route_id: Uuid::nil(),
                seq: i as u32,
                kind: w.kind,
                mode: w.mode,
                label: w.label.clone(),
                text: w.text.clone(),
                lat: pos.lat,
                lng: pos.lng,
                dwell_seconds: w.dwell_seconds,
                point_index: nearest_point_index(&plain, *pos),
            })
            .collect();
        for w in &waypoints {
            if let Some(gp) = gated.get_mut(w.point_index) {
                gp.dwell_seconds = w.dwell_seconds;
            }
        }

        let mut config = self.cfg.default_route_config.clone();
        config.passthrough.insert("idempotencyKey".into(), serde_json::json!(key));
        config
            .passthrough
            .insert("distanceM".into(), serde_json::json!(directions.distance_m));
        config
            .passthrough
            .insert("durationS".into(), serde_json::json!(directions.duration_s));

        let route = self
            .persist(owner, format!("{} waypoints", waypoints.len()), RouteSourceType::OrsWaypoints, gated, config, waypoints)
            .await?;
        Ok(RouteCreation { route, created: true })
    }

    pub async fn update_route_config(
        &self,
        route_id: Uuid,
        overrides: RouteConfigOverrides,
    ) -> AppResult<Route> {
        let route = self
            .store
            .get_route(route_id)
            .await?
            .ok_or_else(|| AppError::NotFound("route".into()))?;
        let merged = route.config.overlay(&overrides);
        self.store.update_route_config(route_id, merged).await
    }

    pub async fn delete_route(&self, route_id: Uuid) -> AppResult<bool> {
        self.store.delete_route(route_id).await
    }

    pub async fn assign_route(&self, device_id: &str, route_id: Uuid) -> AppResult<()> {
        self.store
            .get_route(route_id)
            .await?
            .ok_or_else(|| AppError::NotFound("route".into()))?;
        self.store.assign_route(device_id, route_id).await?;
        Ok(())
    }

    // --- Stream lifecycle facade, spec §4.8 ---

    pub async fn start(
        &self,
        device_id: &str,
        route_id: Uuid,
        overrides: RouteConfigOverrides,
    ) -> AppResult<StreamStatusView> {
        self.scheduler.start(device_id, route_id, overrides).await
    }

    pub async fn pause(&self, device_id: &str) -> AppResult<StreamStatusView> {
        self.scheduler.pause(device_id).await
    }

    pub async fn resume(&self, device_id: &str) -> AppResult<StreamStatusView> {
        self.scheduler.resume(device_id).await
    }

    pub async fn stop(&self, device_id: &str) -> AppResult<StreamStatusView> {
        self.scheduler.stop(device_id).await
    }

    pub async fn skip_dwell(&self, device_id: &str) -> AppResult<()> {
        self.scheduler.skip_dwell(device_id).await
    }

    pub async fn extend_dwell(&self, device_id: &str, seconds: u64) -> AppResult<()> {
        self.scheduler.extend_dwell(device_id, seconds).await
    }

    pub async fn status(&self, device_id: &str) -> AppResult<StreamStatusView> {
        self.scheduler.status(device_id).await
    }

    pub async fn list_active(&self) -> Vec<StreamStatusView> {
        self.scheduler.list_active().await
    }

    pub async fn history(&self, device_id: &str, limit: usize) -> AppResult<Vec<crate::model::AuditEntry>> {
        self.scheduler.history(device_id, limit).await
    }
}

/// `true` if the given status view represents a currently-running stream;
/// a small helper so server HTTP handlers don't need to match on
/// `ScheduleStatus` themselves for the common boolean check.
pub fn is_running(view: &StreamStatusView) -> bool {
    view.status == ScheduleStatus::Started
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;
    use crate::geo::LatLng as Ll;
    use crate::registry::SocketSink;
    use crate::scheduler::SchedulerDefaults;
    use crate::store::InMemoryEntityStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockSink;
    #[async_trait]
    impl SocketSink for MockSink {
        async fn send_json(&self, _value: &serde_json::Value) -> Result<(), AppError> {
            Ok(())
        }
        fn buffered_bytes(&self) -> usize {
            0
        }
        fn tcp_buffered_bytes(&self) -> usize {
            0
        }
        async fn close(&self, _code: u16) {}
    }

    struct MockRouting {
        geocode_calls: Mutex<u32>,
    }

    #[async_trait]
    impl RoutingService for MockRouting {
        async fn geocode(&self, query: &str) -> AppResult<crate::routing::GeocodeHit> {
            *self.geocode_calls.lock().unwrap() += 1;
            Ok(crate::routing::GeocodeHit {
                label: query.to_string(),
                pos: Ll::new(41.0, 29.0),
            })
        }
        async fn autocomplete(
            &self,
            _query: &str,
            _limit: u32,
            _country: Option<&str>,
        ) -> AppResult<Vec<crate::routing::GeocodeHit>> {
            Ok(vec![])
        }
        async fn directions(&self, _profile: &str, waypoints: &[Ll]) -> AppResult<crate::routing::Directions> {
            Ok(crate::routing::Directions {
                points: waypoints.to_vec(),
                distance_m: 1000.0,
                duration_s: 120.0,
            })
        }
    }

    async fn build() -> (ControlPlane, Arc<InMemoryEntityStore>) {
        let store = InMemoryEntityStore::new();
        let cache = InMemoryEphemeralStore::new();
        let registry = SessionRegistry::new(cache.clone(), "srv".into());
        let scheduler =
            StreamScheduler::new(store.clone(), cache.clone(), registry.clone(), SchedulerDefaults::default())
                .await;
        let routing = Arc::new(MockRouting {
            geocode_calls: Mutex::new(0),
        });
        let plane = ControlPlane::new(
            store.clone(),
            cache,
            registry,
            scheduler,
            routing,
            ControlPlaneConfig::default(),
        );
        (plane, store)
    }

    #[tokio::test]
    async fn from_points_rejects_too_short_route() {
        let (plane, _store) = build().await;
        let result = plane
            .create_route_from_points(Uuid::new_v4(), "r".into(), vec![PointInput {
                lat: 0.0,
                lng: 0.0,
                dwell_seconds: None,
                label: None,
            }])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn from_points_persists_route_with_two_points() {
        let (plane, _store) = build().await;
        let owner = Uuid::new_v4();
        let result = plane
            .create_route_from_points(
                owner,
                "r".into(),
                vec![
                    PointInput { lat: 0.0, lng: 0.0, dwell_seconds: None, label: None },
                    PointInput { lat: 0.0, lng: 0.001, dwell_seconds: None, label: None },
                ],
            )
            .await
            .unwrap();
        assert!(result.created);
        assert_eq!(result.route.owner_user_id, owner);
    }

    #[tokio::test]
    async fn from_waypoints_idempotency_key_dedups_within_window() {
        let (plane, _store) = build().await;
        let owner = Uuid::new_v4();
        let waypoints = vec![
            WaypointInput {
                kind: WaypointKind::Origin,
                mode: WaypointMode::Address,
                text: Some("origin".into()),
                lat: None,
                lng: None,
                dwell_seconds: 0,
                label: None,
            },
            WaypointInput {
                kind: WaypointKind::Destination,
                mode: WaypointMode::Address,
                text: Some("destination".into()),
                lat: None,
                lng: None,
                dwell_seconds: 0,
                label: None,
            },
        ];

        let first = plane
            .create_route_from_waypoints(owner, waypoints.clone(), "driving-car", None, Some("key-1".into()), b"body")
            .await
            .unwrap();
        assert!(first.created);

        let second = plane
            .create_route_from_waypoints(owner, waypoints, "driving-car", None, Some("key-1".into()), b"body")
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.route.id, second.route.id);
    }
}
