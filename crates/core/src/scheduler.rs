//! Stream Scheduler (C7): one logical timer per device, advancing through
//! the state machine of spec §4.5 and delegating per-tick physics to the
//! Kinematic Simulator (C8) and admission to the Backpressure Guard (C9).
//!
//! Grounded in `ecto-muni/depot/dispatch`'s `tokio::spawn` + `mpsc`
//! per-connection task shape (`handle_rover_ws`'s `send_task`), generalized
//! from "forward queued messages to one socket" into "drive one device's
//! physics on a fixed tick and forward the result".

use crate::backpressure::{BackpressureConfig, BackpressureGuard, GuardDecision};
use crate::cache::{keys, EphemeralStore};
use crate::error::{AppError, AppResult};
use crate::model::{RouteConfig, RouteConfigOverrides, StreamRecord, StreamStatus};
use crate::registry::SessionRegistry;
use crate::simulator::{
    DistanceEngine, DistanceEngineConfig, EngineMode, Frame, IndexEngine, RunStatus, SimPoint,
    MAX_JUMP_METERS,
};
use crate::store::EntityStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug)]
enum ControlMsg {
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
    SkipDwell(oneshot::Sender<AppResult<()>>),
    ExtendDwell(u64, oneshot::Sender<AppResult<()>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Started,
    Paused,
    Stopped,
}

impl From<ScheduleStatus> for StreamStatus {
    fn from(s: ScheduleStatus) -> Self {
        match s {
            ScheduleStatus::Started => StreamStatus::Started,
            ScheduleStatus::Paused => StreamStatus::Paused,
            ScheduleStatus::Stopped => StreamStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusView {
    pub device_id: String,
    pub route_id: Uuid,
    pub status: ScheduleStatus,
    pub last_frame: Option<Frame>,
    pub updated_at: chrono::DateTime<Utc>,
    /// Set when this view was reconstructed from hot K/V state rather than
    /// a live in-process instance (spec §4.8).
    #[serde(default)]
    pub from_redis: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerDefaults {
    pub tick_clamp_min_ms: u64,
    pub tick_clamp_max_ms: u64,
    pub distance_engine: bool,
    pub backpressure: BackpressureConfig,
}

impl Default for SchedulerDefaults {
    fn default() -> Self {
        Self {
            tick_clamp_min_ms: 200,
            tick_clamp_max_ms: 2000,
            distance_engine: true,
            backpressure: BackpressureConfig::default(),
        }
    }
}

#[derive(Default, Debug)]
pub struct SchedulerCounters {
    pub ticks_emitted: AtomicU64,
    pub ticks_skipped: AtomicU64,
    pub streams_started: AtomicU64,
    pub anti_teleport_events: AtomicU64,
    pub auto_pauses: AtomicU64,
}

enum Engine {
    Distance(DistanceEngine),
    Index(IndexEngine),
}

impl Engine {
    fn mode(&self) -> EngineMode {
        match self {
            Engine::Distance(_) => EngineMode::Distance,
            Engine::Index(_) => EngineMode::Index,
        }
    }

    /// Keepalive-audit throttle (spec §4.6): only the distance engine
    /// tracks a tick counter, since only it models dwell/pause duration.
    /// The index engine has no equivalent state and logs every time it's
    /// asked, matching its "legacy, no velocity model" scope.
    fn should_log_keepalive(&self) -> bool {
        match self {
            Engine::Distance(d) => d.should_log_keepalive(),
            Engine::Index(_) => true,
        }
    }
}

struct StreamHandle {
    control_tx: mpsc::Sender<ControlMsg>,
    snapshot_rx: watch::Receiver<StreamStatusView>,
    task: JoinHandle<()>,
}

pub struct StreamScheduler {
    store: Arc<dyn EntityStore>,
    cache: Arc<dyn EphemeralStore>,
    registry: Arc<SessionRegistry>,
    defaults: SchedulerDefaults,
    instances: Arc<RwLock<HashMap<String, StreamHandle>>>,
    pub counters: Arc<SchedulerCounters>,
}

impl StreamScheduler {
    /// Async because wiring the registry's drop callback must complete
    /// before any `bind()` call elsewhere in the process can race it.
    pub async fn new(
        store: Arc<dyn EntityStore>,
        cache: Arc<dyn EphemeralStore>,
        registry: Arc<SessionRegistry>,
        defaults: SchedulerDefaults,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            store,
            cache,
            registry: registry.clone(),
            defaults,
            instances: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(SchedulerCounters::default()),
        });

        // Session Registry invariant (spec §4.3): replacing a device's
        // socket binding auto-pauses any live stream for that device.
        let instances = scheduler.instances.clone();
        registry
            .set_on_drop(Arc::new(move |device_id: &str| {
                let instances = instances.clone();
                let device_id = device_id.to_string();
                tokio::spawn(async move {
                    let instances = instances.read().await;
                    if let Some(handle) = instances.get(&device_id) {
                        let _ = handle.control_tx.try_send(ControlMsg::Pause);
                    }
                });
            }))
            .await;

        scheduler
    }

    /// start(device, route, overrides) — spec §4.5. Takes `&Arc<Self>`
    /// because it hands a clone of the scheduler to the spawned stream
    /// task.
    pub async fn start(
        self: &Arc<Self>,
        device_id: &str,
        route_id: Uuid,
        overrides: RouteConfigOverrides,
    ) -> AppResult<StreamStatusView> {
        if !self.registry.is_bound(device_id).await {
            return Err(AppError::DeviceNotConnected);
        }
        let route = self
            .store
            .get_route(route_id)
            .await?
            .ok_or_else(|| AppError::NotFound("route".into()))?;

        // "If another instance exists, stop it first (synchronously)."
        self.stop(device_id).await.ok();

        let points = self.store.get_route_points(route_id).await?;
        if points.len() < 2 {
            return Err(AppError::InvalidRouteGeometry(
                "route has fewer than 2 points".into(),
            ));
        }
        let config: RouteConfig = route.config.overlay(&overrides);
        let sim_points: Vec<SimPoint> = points
            .iter()
            .map(|p| SimPoint {
                pos: p.latlng(),
                dwell_seconds: p.dwell_seconds,
            })
            .collect();

        let stream_id = Uuid::new_v4();
        let record = StreamRecord {
            id: stream_id,
            device_id: device_id.to_string(),
            route_id,
            status: StreamStatus::Started,
            speed: config.speed,
            r#loop: config.r#loop,
            started_at: Utc::now(),
            stopped_at: None,
        };
        self.store.upsert_stream(record).await?;
        self.write_hot_state(device_id, route_id, ScheduleStatus::Started)
            .await;

        let (control_tx, mut control_rx) = mpsc::channel(16);
        let initial_view = StreamStatusView {
            device_id: device_id.to_string(),
            route_id,
            status: ScheduleStatus::Started,
            last_frame: None,
            updated_at: Utc::now(),
            from_redis: false,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial_view.clone());

        let scheduler = self.clone();
        let task_device_id = device_id.to_string();
        let task = tokio::spawn(async move {
            scheduler
                .run_stream_loop(
                    task_device_id,
                    stream_id,
                    route_id,
                    config,
                    sim_points,
                    &mut control_rx,
                    snapshot_tx,
                )
                .await;
        });

        self.instances.write().await.insert(
            device_id.to_string(),
            StreamHandle {
                control_tx,
                snapshot_rx: snapshot_rx.clone(),
                task,
            },
        );
        self.counters.streams_started.fetch_add(1, Ordering::Relaxed);
        let initial_snapshot = snapshot_rx.borrow().clone();
        Ok(initial_snapshot)
    }

    async fn run_stream_loop(
        self: Arc<Self>,
        device_id: String,
        stream_id: Uuid,
        route_id: Uuid,
        config: RouteConfig,
        sim_points: Vec<SimPoint>,
        control_rx: &mut mpsc::Receiver<ControlMsg>,
        snapshot_tx: watch::Sender<StreamStatusView>,
    ) {
        let mut engine = if self.defaults.distance_engine {
            Engine::Distance(DistanceEngine::new(
                sim_points,
                DistanceEngineConfig {
                    route_id,
                    accuracy: config.accuracy,
                    target_speed_mps: config.speed / 3.6,
                    interval_ms: config.interval_ms,
                    r#loop: config.r#loop,
                },
            ))
        } else {
            Engine::Index(IndexEngine::new(
                sim_points,
                route_id,
                config.accuracy,
                config.r#loop,
            ))
        };

        let mut run_status = RunStatus::Running;
        let mut guard = BackpressureGuard::new(self.defaults.backpressure);
        let mut last_tick = Instant::now();
        let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // "Never returns until at least the first emission has been
        // scheduled" — emit once immediately before entering the loop.
        self.emit_tick(
            &device_id,
            &mut engine,
            &mut run_status,
            &mut guard,
            config.interval_ms,
            &snapshot_tx,
            stream_id,
            route_id,
        )
        .await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick).as_millis() as u64;
                    last_tick = now;
                    let dt_ms = elapsed.clamp(self.defaults.tick_clamp_min_ms, self.defaults.tick_clamp_max_ms);

                    let terminated = self
                        .emit_tick(&device_id, &mut engine, &mut run_status, &mut guard, dt_ms, &snapshot_tx, stream_id, route_id)
                        .await;
                    if terminated {
                        self.finish_stream(&device_id, stream_id, true).await;
                        break;
                    }
                }
                msg = control_rx.recv() => {
                    match msg {
                        Some(ControlMsg::Pause) => {
                            run_status = RunStatus::Paused;
                            self.transition_status(stream_id, ScheduleStatus::Paused, &snapshot_tx).await;
                        }
                        Some(ControlMsg::Resume) => {
                            // Idempotent: resuming an already-running stream
                            // is a no-op on the timer (spec §9 open question).
                            if run_status == RunStatus::Paused {
                                run_status = RunStatus::Running;
                                if let Engine::Distance(d) = &mut engine {
                                    d.reset_reference();
                                }
                                self.transition_status(stream_id, ScheduleStatus::Started, &snapshot_tx).await;
                                self.emit_tick(&device_id, &mut engine, &mut run_status, &mut guard, config.interval_ms, &snapshot_tx, stream_id, route_id).await;
                            }
                        }
                        Some(ControlMsg::Stop(ack)) => {
                            self.finish_stream(&device_id, stream_id, false).await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(ControlMsg::SkipDwell(ack)) => {
                            let res = match &mut engine {
                                Engine::Distance(d) => {
                                    if d.skip_dwell() {
                                        Ok(())
                                    } else {
                                        Err(AppError::Conflict("dwell-skip on non-waiting stream".into()))
                                    }
                                }
                                Engine::Index(_) => Err(AppError::Conflict("dwell-skip on non-waiting stream".into())),
                            };
                            let _ = ack.send(res);
                        }
                        Some(ControlMsg::ExtendDwell(secs, ack)) => {
                            let res = match &mut engine {
                                Engine::Distance(d) => {
                                    if d.extend_dwell(secs, config.interval_ms) {
                                        Ok(())
                                    } else {
                                        Err(AppError::Conflict("dwell-extend on non-waiting stream".into()))
                                    }
                                }
                                Engine::Index(_) => Err(AppError::Conflict("dwell-extend on non-waiting stream".into())),
                            };
                            let _ = ack.send(res);
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = engine.mode();
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_tick(
        &self,
        device_id: &str,
        engine: &mut Engine,
        run_status: &mut RunStatus,
        guard: &mut BackpressureGuard,
        dt_ms: u64,
        snapshot_tx: &watch::Sender<StreamStatusView>,
        stream_id: Uuid,
        route_id: Uuid,
    ) -> bool {
        let socket = self.registry.handle(device_id).await;
        let sample = socket
            .as_ref()
            .map(|s| (s.buffered_bytes(), s.tcp_buffered_bytes()))
            .unwrap_or((0, 0));

        if guard.should_log_health(Instant::now()) {
            self.append_audit(
                device_id,
                "health",
                serde_json::json!({
                    "wsBuffered": sample.0,
                    "tcpBuffered": sample.1,
                    "strikes": guard.strike_count(),
                }),
            )
            .await;
        }

        match guard.evaluate(sample, Instant::now()) {
            GuardDecision::SkipAndStrike => {
                self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            GuardDecision::SkipAndAutoPause => {
                self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                self.counters.auto_pauses.fetch_add(1, Ordering::Relaxed);
                *run_status = RunStatus::Paused;
                self.transition_status(stream_id, ScheduleStatus::Paused, snapshot_tx)
                    .await;
                self.append_audit(device_id, "ws_pressure_auto_pause", serde_json::json!({}))
                    .await;
                return false;
            }
            GuardDecision::Emit => {}
        }

        let outcome = match engine {
            Engine::Distance(d) => d.tick(dt_ms, *run_status),
            Engine::Index(i) => i.tick(dt_ms, *run_status, false),
        };

        let is_idle = matches!(outcome.frame.state, crate::simulator::SimState::Wait | crate::simulator::SimState::Paused);
        if is_idle && engine.should_log_keepalive() {
            self.append_audit(
                device_id,
                "keepalive",
                serde_json::json!({"state": outcome.frame.state}),
            )
            .await;
        }

        if outcome.anti_teleport {
            self.counters
                .anti_teleport_events
                .fetch_add(1, Ordering::Relaxed);
            *run_status = RunStatus::Paused;
            self.transition_status(stream_id, ScheduleStatus::Paused, snapshot_tx)
                .await;
            self.append_audit(
                device_id,
                "ANTI_TELEPORT_JUMP",
                serde_json::json!({"maxJumpMeters": MAX_JUMP_METERS}),
            )
            .await;
        }

        if let Some(socket) = &socket {
            let frame_json = serde_json::json!({
                "type": "MOCK_LOCATION",
                "payload": {
                    "lat": outcome.frame.lat,
                    "lng": outcome.frame.lng,
                    "speed": outcome.frame.speed,
                    "bearing": outcome.frame.bearing,
                    "accuracy": outcome.frame.accuracy,
                    "state": outcome.frame.state,
                },
                "meta": outcome.frame.meta,
            });
            let _ = socket.send_json(&frame_json).await;
        }
        self.counters.ticks_emitted.fetch_add(1, Ordering::Relaxed);
        self.write_hot_state(device_id, route_id, self.status_from_run(*run_status))
            .await;

        snapshot_tx.send_modify(|view| {
            view.last_frame = Some(outcome.frame);
            view.updated_at = Utc::now();
        });

        outcome.terminated
    }

    fn status_from_run(&self, run: RunStatus) -> ScheduleStatus {
        match run {
            RunStatus::Running => ScheduleStatus::Started,
            RunStatus::Paused => ScheduleStatus::Paused,
        }
    }

    async fn transition_status(
        &self,
        stream_id: Uuid,
        status: ScheduleStatus,
        snapshot_tx: &watch::Sender<StreamStatusView>,
    ) {
        snapshot_tx.send_modify(|view| {
            view.status = status;
            view.updated_at = Utc::now();
        });
        if let Some(mut record) = self.store.get_stream(stream_id).await.ok().flatten() {
            record.status = status.into();
            if status == ScheduleStatus::Stopped {
                record.stopped_at = Some(Utc::now());
            }
            let _ = self.store.upsert_stream(record).await;
        }
    }

    async fn finish_stream(&self, device_id: &str, stream_id: Uuid, auto: bool) {
        if let Some(mut record) = self.store.get_stream(stream_id).await.ok().flatten() {
            record.status = StreamStatus::Stopped;
            record.stopped_at = Some(Utc::now());
            let _ = self.store.upsert_stream(record).await;
        }
        self.cache.delete(&keys::stream(device_id)).await;
        self.append_audit(
            device_id,
            if auto { "STREAM_STOPPED" } else { "stream_stopped_by_operator" },
            serde_json::json!({}),
        )
        .await;
    }

    async fn write_hot_state(&self, device_id: &str, route_id: Uuid, status: ScheduleStatus) {
        self.cache
            .set(
                &keys::stream(device_id),
                serde_json::json!({
                    "deviceId": device_id,
                    "routeId": route_id,
                    "status": status,
                    "updatedAt": Utc::now(),
                }),
                None,
            )
            .await;
    }

    async fn append_audit(&self, device_id: &str, action: &str, meta: serde_json::Value) {
        let entry = crate::model::AuditEntry {
            action: action.to_string(),
            user_id: None,
            device_id: Some(device_id.to_string()),
            meta,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_audit(entry).await {
            tracing::warn!(error = %e, "audit append failed, continuing");
        }
    }

    /// pause(device) — idempotent.
    pub async fn pause(&self, device_id: &str) -> AppResult<StreamStatusView> {
        let instances = self.instances.read().await;
        match instances.get(device_id) {
            Some(handle) => {
                let _ = handle.control_tx.send(ControlMsg::Pause).await;
                Ok(handle.snapshot_rx.borrow().clone())
            }
            None => self.fallback_status(device_id).await,
        }
    }

    /// resume(device) — idempotent; no-op on the timer if already running
    /// (spec §9 open question resolution).
    pub async fn resume(&self, device_id: &str) -> AppResult<StreamStatusView> {
        let instances = self.instances.read().await;
        match instances.get(device_id) {
            Some(handle) => {
                let _ = handle.control_tx.send(ControlMsg::Resume).await;
                Ok(handle.snapshot_rx.borrow().clone())
            }
            None => self.fallback_status(device_id).await,
        }
    }

    /// stop(device) — idempotent; returns a synthetic `stopped` view if
    /// there was no live instance (spec §4.5).
    pub async fn stop(&self, device_id: &str) -> AppResult<StreamStatusView> {
        let handle = self.instances.write().await.remove(device_id);
        match handle {
            Some(handle) => {
                let (tx, rx) = oneshot::channel();
                let _ = handle.control_tx.send(ControlMsg::Stop(tx)).await;
                let _ = rx.await;
                let _ = handle.task.await;
                let mut view = handle.snapshot_rx.borrow().clone();
                view.status = ScheduleStatus::Stopped;
                Ok(view)
            }
            None => Ok(StreamStatusView {
                device_id: device_id.to_string(),
                route_id: Uuid::nil(),
                status: ScheduleStatus::Stopped,
                last_frame: None,
                updated_at: Utc::now(),
                from_redis: false,
            }),
        }
    }

    pub async fn skip_dwell(&self, device_id: &str) -> AppResult<()> {
        let instances = self.instances.read().await;
        let handle = instances
            .get(device_id)
            .ok_or_else(|| AppError::NotFound("stream instance".into()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .control_tx
            .send(ControlMsg::SkipDwell(tx))
            .await
            .map_err(|_| AppError::Internal("stream task gone".into()))?;
        rx.await.map_err(|_| AppError::Internal("stream task gone".into()))?
    }

    pub async fn extend_dwell(&self, device_id: &str, seconds: u64) -> AppResult<()> {
        let instances = self.instances.read().await;
        let handle = instances
            .get(device_id)
            .ok_or_else(|| AppError::NotFound("stream instance".into()))?;
        let (tx, rx) = oneshot::channel();
        handle
            .control_tx
            .send(ControlMsg::ExtendDwell(seconds, tx))
            .await
            .map_err(|_| AppError::Internal("stream task gone".into()))?;
        rx.await.map_err(|_| AppError::Internal("stream task gone".into()))?
    }

    /// status(deviceId) — live projection if present, else hot K/V state
    /// annotated `fromRedis=true` (spec §4.8).
    pub async fn status(&self, device_id: &str) -> AppResult<StreamStatusView> {
        let instances = self.instances.read().await;
        if let Some(handle) = instances.get(device_id) {
            return Ok(handle.snapshot_rx.borrow().clone());
        }
        drop(instances);
        self.fallback_status(device_id).await
    }

    async fn fallback_status(&self, device_id: &str) -> AppResult<StreamStatusView> {
        match self.cache.get(&keys::stream(device_id)).await {
            Some(v) => {
                let status: ScheduleStatus =
                    serde_json::from_value(v.get("status").cloned().unwrap_or_default())
                        .unwrap_or(ScheduleStatus::Stopped);
                let route_id = v
                    .get("routeId")
                    .and_then(|r| r.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .unwrap_or_else(Uuid::nil);
                Ok(StreamStatusView {
                    device_id: device_id.to_string(),
                    route_id,
                    status,
                    last_frame: None,
                    updated_at: Utc::now(),
                    from_redis: true,
                })
            }
            None => Err(AppError::NotFound("stream".into())),
        }
    }

    pub async fn list_active(&self) -> Vec<StreamStatusView> {
        let instances = self.instances.read().await;
        instances
            .values()
            .map(|h| h.snapshot_rx.borrow().clone())
            .collect()
    }

    pub async fn history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> AppResult<Vec<crate::model::AuditEntry>> {
        self.store.recent_audit_for_device(device_id, limit).await
    }

    /// Enumerate and delete `stream:*` hot keys left by a previous crashed
    /// process (spec §5 "On startup...").
    pub async fn reap_stale_hot_state(&self) -> usize {
        let stale = self.cache.keys_with_prefix("stream:").await;
        for key in &stale {
            self.cache.delete(key).await;
        }
        stale.len()
    }

    /// Graceful shutdown: cancel every running timer (spec §5).
    pub async fn shutdown_all(&self) {
        let mut instances = self.instances.write().await;
        for (_, handle) in instances.drain() {
            let (tx, rx) = oneshot::channel();
            let _ = handle.control_tx.send(ControlMsg::Stop(tx)).await;
            let _ = rx.await;
            let _ = handle.task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;
    use crate::model::{Route, RouteSourceType, RoutePoint};
    use crate::registry::{SocketSink};
    use crate::store::InMemoryEntityStore;
    use async_trait::async_trait;

    struct MockSink {
        sent: std::sync::Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl SocketSink for MockSink {
        async fn send_json(&self, value: &serde_json::Value) -> Result<(), AppError> {
            self.sent.lock().unwrap().push(value.clone());
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

    async fn setup() -> (Arc<StreamScheduler>, Arc<SessionRegistry>, Uuid, String) {
        let store = InMemoryEntityStore::new();
        let cache = InMemoryEphemeralStore::new();
        let registry = SessionRegistry::new(cache.clone(), "srv-test".into());
        let scheduler = StreamScheduler::new(
            store.clone(),
            cache,
            registry.clone(),
            SchedulerDefaults {
                tick_clamp_min_ms: 50,
                tick_clamp_max_ms: 500,
                ..Default::default()
            },
        )
        .await;

        let owner = Uuid::new_v4();
        let route_id = Uuid::new_v4();
        let route = Route {
            id: route_id,
            owner_user_id: owner,
            name: "loop".into(),
            source_type: RouteSourceType::Points,
            config: RouteConfig {
                interval_ms: 100,
                speed: 36.0,
                ..Default::default()
            },
            created_at: Utc::now(),
        };
        let points = vec![
            RoutePoint {
                route_id,
                seq: 0,
                lat: 0.0,
                lng: 0.0,
                speed: None,
                bearing: None,
                accuracy: None,
                dwell_seconds: 0,
            },
            RoutePoint {
                route_id,
                seq: 1,
                lat: 0.0,
                lng: 0.01,
                speed: None,
                bearing: None,
                accuracy: None,
                dwell_seconds: 0,
            },
        ];
        store.create_route(route, points, vec![]).await.unwrap();

        let device_id = "dev-A".to_string();
        registry
            .bind(
                &device_id,
                Arc::new(MockSink {
                    sent: Default::default(),
                }),
            )
            .await;

        (scheduler, registry, route_id, device_id)
    }

    #[tokio::test]
    async fn start_requires_bound_socket() {
        let store = InMemoryEntityStore::new();
        let cache = InMemoryEphemeralStore::new();
        let registry = SessionRegistry::new(cache.clone(), "srv-test".into());
        let scheduler =
            StreamScheduler::new(store, cache, registry, SchedulerDefaults::default()).await;
        let result = scheduler
            .start("unbound-device", Uuid::new_v4(), RouteConfigOverrides::default())
            .await;
        assert!(matches!(result, Err(AppError::DeviceNotConnected)));
    }

    #[tokio::test]
    async fn start_emits_at_least_one_frame_before_returning() {
        let (scheduler, _registry, route_id, device_id) = setup().await;
        let view = scheduler
            .start(&device_id, route_id, RouteConfigOverrides::default())
            .await
            .unwrap();
        assert!(view.last_frame.is_some());
        assert_eq!(view.status, ScheduleStatus::Started);
        scheduler.stop(&device_id).await.unwrap();
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_status() {
        let (scheduler, _registry, route_id, device_id) = setup().await;
        scheduler
            .start(&device_id, route_id, RouteConfigOverrides::default())
            .await
            .unwrap();

        let paused = scheduler.pause(&device_id).await.unwrap();
        assert_eq!(paused.status, ScheduleStatus::Paused);

        let resumed = scheduler.resume(&device_id).await.unwrap();
        assert_eq!(resumed.status, ScheduleStatus::Started);

        scheduler.stop(&device_id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (scheduler, _registry, route_id, device_id) = setup().await;
        scheduler
            .start(&device_id, route_id, RouteConfigOverrides::default())
            .await
            .unwrap();
        let first = scheduler.stop(&device_id).await.unwrap();
        assert_eq!(first.status, ScheduleStatus::Stopped);
        let second = scheduler.stop(&device_id).await.unwrap();
        assert_eq!(second.status, ScheduleStatus::Stopped);
    }

    #[tokio::test]
    async fn rebinding_device_auto_pauses_running_stream() {
        let (scheduler, registry, route_id, device_id) = setup().await;
        scheduler
            .start(&device_id, route_id, RouteConfigOverrides::default())
            .await
            .unwrap();

        registry
            .bind(
                &device_id,
                Arc::new(MockSink {
                    sent: Default::default(),
                }),
            )
            .await;

        // the drop callback dispatches asynchronously; give it a tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = scheduler.status(&device_id).await.unwrap();
        assert_eq!(status.status, ScheduleStatus::Paused);

        scheduler.stop(&device_id).await.unwrap();
    }
}
