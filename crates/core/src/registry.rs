//! Session Registry (C5): a process-local `deviceId -> socket handle` table
//! plus the K/V presence keys. Grounded in `ecto-muni/depot/dispatch`'s
//! `RwLock<HashMap<String, ConnectedRover>>` (`AppState::rovers` /
//! `send_to_rover`), generalized with the presence/authorization contract
//! spec §4.3 adds on top.

use crate::cache::{keys, EphemeralStore, WS_CONN_TTL};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Abstraction over a live socket so the scheduler/simulator never depend
/// on `axum`. The server crate's WS handler implements this over the real
/// `axum::extract::ws::WebSocket` sender half.
#[async_trait]
pub trait SocketSink: Send + Sync {
    async fn send_json(&self, value: &serde_json::Value) -> Result<(), AppError>;
    /// Bytes queued in the framing layer awaiting transmission (C9).
    fn buffered_bytes(&self) -> usize;
    /// Bytes in the kernel/send buffer (C9).
    fn tcp_buffered_bytes(&self) -> usize;
    async fn close(&self, code: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsAuthOutcome {
    pub role_is_admin: bool,
}

struct Binding {
    socket: Arc<dyn SocketSink>,
    server_id: String,
}

/// Per-device socket handle table + presence refresh + authorization
/// cache (spec §4.3).
pub struct SessionRegistry {
    bindings: RwLock<HashMap<String, Binding>>,
    cache: Arc<dyn EphemeralStore>,
    server_id: String,
    /// Invoked whenever a binding is replaced or dropped, so the scheduler
    /// can auto-pause the device's stream (spec §4.3 invariant).
    on_drop: RwLock<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<dyn EphemeralStore>, server_id: String) -> Arc<Self> {
        Arc::new(Self {
            bindings: RwLock::new(HashMap::new()),
            cache,
            server_id,
            on_drop: RwLock::new(None),
        })
    }

    pub async fn set_on_drop(&self, f: Arc<dyn Fn(&str) + Send + Sync>) {
        *self.on_drop.write().await = Some(f);
    }

    /// Bind a socket to a device, implicitly dropping and auto-pausing any
    /// prior binding (spec §8 testable property 9 "socket single-binding").
    pub async fn bind(&self, device_id: &str, socket: Arc<dyn SocketSink>) {
        let had_previous = {
            let mut bindings = self.bindings.write().await;
            let had_previous = bindings.contains_key(device_id);
            bindings.insert(
                device_id.to_string(),
                Binding {
                    socket,
                    server_id: self.server_id.clone(),
                },
            );
            had_previous
        };

        self.cache
            .set(
                &keys::ws_conn(device_id),
                serde_json::json!({"serverId": self.server_id, "connectedAt": Utc::now()}),
                Some(WS_CONN_TTL),
            )
            .await;

        if had_previous {
            if let Some(f) = self.on_drop.read().await.clone() {
                f(device_id);
            }
        }
    }

    pub async fn refresh(&self, device_id: &str) {
        self.cache
            .refresh_ttl(&keys::ws_conn(device_id), WS_CONN_TTL)
            .await;
    }

    pub async fn drop_device(&self, device_id: &str) {
        self.bindings.write().await.remove(device_id);
        self.cache.delete(&keys::ws_conn(device_id)).await;
    }

    pub async fn handle(&self, device_id: &str) -> Option<Arc<dyn SocketSink>> {
        self.bindings
            .read()
            .await
            .get(device_id)
            .map(|b| b.socket.clone())
    }

    pub async fn is_bound(&self, device_id: &str) -> bool {
        self.bindings.read().await.contains_key(device_id)
    }

    /// Read `ws:auth:<deviceId>` and compare the presented token by
    /// equality (spec §4.3; constant-time comparison is acceptable but not
    /// required). `Some` carries the cached role so a hit needs no token
    /// decode (spec §4.4 hybrid auth step 1).
    pub async fn authorized(&self, device_id: &str, token: &str) -> Option<WsAuthOutcome> {
        let v = self.cache.get(&keys::ws_auth(device_id)).await?;
        if v.get("token").and_then(|t| t.as_str()) != Some(token) {
            return None;
        }
        Some(WsAuthOutcome {
            role_is_admin: v.get("roleIsAdmin").and_then(|b| b.as_bool()).unwrap_or(false),
        })
    }

    pub async fn cache_authorization(
        &self,
        device_id: &str,
        user_id: uuid::Uuid,
        role_is_admin: bool,
        token: &str,
    ) {
        self.cache
            .set(
                &keys::ws_auth(device_id),
                serde_json::json!({
                    "userId": user_id,
                    "roleIsAdmin": role_is_admin,
                    "token": token,
                    "authorizedAt": Utc::now(),
                }),
                Some(crate::cache::WS_AUTH_TTL),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryEphemeralStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    #[tokio::test]
    async fn rebinding_triggers_on_drop() {
        let cache = InMemoryEphemeralStore::new();
        let registry = SessionRegistry::new(cache, "srv-1".into());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry
            .set_on_drop(Arc::new(move |_id| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let sink1 = Arc::new(MockSink {
            sent: Default::default(),
        });
        registry.bind("dev-1", sink1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let sink2 = Arc::new(MockSink {
            sent: Default::default(),
        });
        registry.bind("dev-1", sink2).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_lookup_is_none_after_drop() {
        let cache = InMemoryEphemeralStore::new();
        let registry = SessionRegistry::new(cache, "srv-1".into());
        let sink = Arc::new(MockSink {
            sent: Default::default(),
        });
        registry.bind("dev-1", sink).await;
        assert!(registry.handle("dev-1").await.is_some());
        registry.drop_device("dev-1").await;
        assert!(registry.handle("dev-1").await.is_none());
    }
}
