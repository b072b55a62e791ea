//! Socket server (C6): upgrade, hybrid handshake authentication, and the
//! post-handshake frame loop (spec §4.4). Grounded in
//! `ecto-muni/depot/dispatch`'s `handle_rover_ws`: split the socket, spawn a
//! forwarding task fed by an mpsc channel so `SocketSink::send_json` never
//! needs to hold the sender half across an await, and drive the receiver
//! half in a `while let Some(msg) = receiver.next().await` loop.

use crate::state::SharedState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use gpsfleet_core::auth::{TokenCodec, TokenRole};
use gpsfleet_core::error::AppError;
use gpsfleet_core::registry::SocketSink;
use gpsfleet_core::store::EntityStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

enum Outbound {
    Text(String, usize),
    Close(u16),
}

/// `SocketSink` over the real `axum::extract::ws::WebSocket` sender half.
/// The sender itself lives in a dedicated forwarding task (it cannot be
/// cloned across tasks); this struct only queues onto an mpsc channel and
/// tracks the queued byte count for the Backpressure Guard (C9).
struct AxumSocketSink {
    tx: mpsc::Sender<Outbound>,
    queued_bytes: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl SocketSink for AxumSocketSink {
    async fn send_json(&self, value: &serde_json::Value) -> Result<(), AppError> {
        let text = serde_json::to_string(value).map_err(|e| AppError::Internal(e.to_string()))?;
        let len = text.len();
        self.queued_bytes.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(Outbound::Text(text, len)).await.is_err() {
            self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
            return Err(AppError::Internal("socket closed".into()));
        }
        Ok(())
    }

    fn buffered_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    fn tcp_buffered_bytes(&self) -> usize {
        // Not observable through axum's WebSocket abstraction; the ws-layer
        // queue above is the only backpressure signal we have.
        0
    }

    async fn close(&self, code: u16) {
        let _ = self.tx.send(Outbound::Close(code)).await;
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

fn extract_credentials(headers: &HeaderMap, query: &WsQuery) -> (Option<String>, Option<String>) {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .or_else(|| query.token.clone());

    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .or_else(|| query.device_id.clone());

    (token, device_id)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let (token, device_id) = extract_credentials(&headers, &query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, device_id))
}

struct Authorized {
    device_id: Option<String>,
    role_is_admin: bool,
}

async fn authorize(
    state: &SharedState,
    token: Option<&str>,
    device_id: Option<&str>,
) -> Result<Authorized, u16> {
    let token = token.ok_or(4001u16)?;

    if let Some(device_id) = device_id {
        if let Some(outcome) = state.registry.authorized(device_id, token).await {
            return Ok(Authorized {
                device_id: Some(device_id.to_string()),
                role_is_admin: outcome.role_is_admin,
            });
        }
    }

    let claims = state.tokens.decode(token).map_err(|_| 4001u16)?;

    let (resolved_device_id, role_is_admin) = match claims.role {
        TokenRole::Device => {
            let device_id = device_id.ok_or(4003u16)?;
            if claims.device_id.as_deref() != Some(device_id) {
                return Err(4001);
            }
            (Some(device_id.to_string()), false)
        }
        TokenRole::Admin | TokenRole::User => {
            let role_is_admin = claims.role == TokenRole::Admin;
            match device_id {
                Some(device_id) => (Some(device_id.to_string()), role_is_admin),
                None if role_is_admin => (None, true),
                None => return Err(4003),
            }
        }
    };

    if let Some(user_id) = claims.sub.parse().ok() {
        if let Some(device_id) = &resolved_device_id {
            state
                .registry
                .cache_authorization(device_id, user_id, role_is_admin, token)
                .await;
        }
    }

    Ok(Authorized {
        device_id: resolved_device_id,
        role_is_admin,
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    token: Option<String>,
    device_id_hint: Option<String>,
) {
    let authorized = match authorize(&state, token.as_deref(), device_id_hint.as_deref()).await {
        Ok(a) => a,
        Err(close_code) => {
            close_with_code(socket, close_code).await;
            return;
        }
    };

    if let Some(device_id) = &authorized.device_id {
        match state.store.get_device(device_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                close_with_code(socket, 4004).await;
                return;
            }
            Err(_) => {
                close_with_code(socket, 4500).await;
                return;
            }
        }
    }

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let send_task_queued_bytes = queued_bytes.clone();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Outbound::Text(text, len) => {
                    queued_bytes_sub(&send_task_queued_bytes, len);
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let sink: Arc<dyn SocketSink> = Arc::new(AxumSocketSink {
        tx: tx.clone(),
        queued_bytes,
    });

    let bound_device_id = if !authorized.role_is_admin || authorized.device_id.is_some() {
        // Devices always bind; an admin/user scoped to a specific device
        // also binds so that device's stream has somewhere to emit to.
        authorized.device_id.clone()
    } else {
        None
    };

    if let Some(device_id) = &bound_device_id {
        state.registry.bind(device_id, sink.clone()).await;
        let _ = state.store.set_device_connected(device_id, true).await;
        state.broadcast(
            "DEVICE_CONNECTED",
            serde_json::json!({"deviceId": device_id}),
        );
    }

    if let Some(device_id) = &authorized.device_id {
        let _ = sink
            .send_json(&serde_json::json!({
                "type": "CONNECTED",
                "payload": {
                    "deviceId": device_id,
                    "message": "connected",
                    "timestamp": chrono::Utc::now(),
                }
            }))
            .await;
    }

    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let admin_relay_sink = sink.clone();
    let is_admin = authorized.role_is_admin;
    let relay_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(event) => {
                    let admin_only = event.event_type.starts_with("DEVICE_");
                    if admin_only && !is_admin {
                        continue;
                    }
                    let frame = serde_json::json!({
                        "type": event.event_type,
                        "payload": event.payload,
                    });
                    if admin_relay_sink.send_json(&frame).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => break,
        };
        match msg {
            Message::Text(text) => handle_frame(&state, &sink, authorized.device_id.as_deref(), &text).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {}
        }
    }

    relay_task.abort();
    let _ = tx.send(Outbound::Close(1000)).await;
    let _ = send_task.await;

    if let Some(device_id) = &bound_device_id {
        state.registry.drop_device(device_id).await;
        let _ = state.store.set_device_connected(device_id, false).await;
        let _ = state
            .store
            .append_audit(gpsfleet_core::model::AuditEntry {
                action: "DEVICE_DISCONNECTED".into(),
                user_id: None,
                device_id: Some(device_id.clone()),
                meta: serde_json::json!({}),
                created_at: chrono::Utc::now(),
            })
            .await;
        state.broadcast(
            "DEVICE_DISCONNECTED",
            serde_json::json!({"deviceId": device_id}),
        );
    }
}

fn queued_bytes_sub(counter: &Arc<AtomicUsize>, len: usize) {
    counter.fetch_sub(len, Ordering::Relaxed);
}

async fn handle_frame(state: &SharedState, sink: &Arc<dyn SocketSink>, device_id: Option<&str>, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::debug!("invalid ws frame, counted");
        return;
    };
    let frame_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match frame_type {
        "PING" => {
            if let Some(device_id) = device_id {
                state.registry.refresh(device_id).await;
            }
            let _ = sink
                .send_json(&serde_json::json!({"type": "PONG", "timestamp": chrono::Utc::now()}))
                .await;
        }
        "STATUS" => {
            if let Some(device_id) = device_id {
                let payload = value.get("payload").cloned().unwrap_or(serde_json::json!({}));
                let _ = state
                    .store
                    .append_audit(gpsfleet_core::model::AuditEntry {
                        action: "device_status".into(),
                        user_id: None,
                        device_id: Some(device_id.to_string()),
                        meta: payload,
                        created_at: chrono::Utc::now(),
                    })
                    .await;
                let _ = state.store.touch_device_last_seen(device_id).await;
            }
        }
        "ACK" => {
            tracing::trace!("ack received");
        }
        _ => {
            tracing::trace!(frame_type, "unknown ws frame, counted");
        }
    }
}

async fn close_with_code(socket: WebSocket, code: u16) {
    let (mut sender, _receiver) = socket.split();
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await;
}

/// True when a request looks like a WebSocket upgrade attempt, used by the
/// router fallback to return 400 for any upgrade path other than `/ws`
/// (spec §4.4 "Only the exact path /ws is accepted... any other path
/// returns an HTTP 400 from the upgrade handler without consuming the
/// socket").
pub fn looks_like_ws_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

#[allow(dead_code)]
type UnusedQueryMap = HashMap<String, String>;
