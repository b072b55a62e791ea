//! Ephemeral store adapter (C4): TTL'd keys for WS auth, WS presence, hot
//! stream state, geocode cache, rate-limit sliding windows (spec §3
//! "Ephemeral keys"). Treated as an abstract store per spec §1; the
//! in-memory adapter is the default, `redis-store` adds a `redis`-backed
//! one (grounded in `foofork-riptidecrawler`'s `redis` usage).

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>);
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn delete(&self, key: &str);
    /// Refresh a key's TTL without changing its value; no-op if absent.
    async fn refresh_ttl(&self, key: &str, ttl: Duration);
    /// Keys matching a `prefix*` glob, for startup cleanup of `stream:*`
    /// (spec §5 "On startup, enumerate and delete stream:* hot keys").
    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Sliding-window counter: record `nonce` at `now`, then return the
    /// count of entries within `window` of `now` (spec §3 `ratelimit:*`
    /// sorted-set semantics).
    async fn incr_window(&self, key: &str, nonce: u64, now_ms: u64, window_ms: u64) -> u64;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

struct WindowEntry {
    timestamps: Vec<(u64, u64)>, // (timestamp_ms, nonce)
}

#[derive(Default)]
pub struct InMemoryEphemeralStore {
    entries: DashMap<String, Entry>,
    windows: DashMap<String, WindowEntry>,
}

impl InMemoryEphemeralStore {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|e| Instant::now() < e).unwrap_or(true)
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(e) if Self::is_live(&e) => return Some(e.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
        self.windows.remove(key);
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) {
        if let Some(mut e) = self.entries.get_mut(key) {
            e.expires_at = Some(Instant::now() + ttl);
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    async fn incr_window(&self, key: &str, nonce: u64, now_ms: u64, window_ms: u64) -> u64 {
        let mut w = self.windows.entry(key.to_string()).or_insert_with(|| WindowEntry {
            timestamps: Vec::new(),
        });
        let cutoff = now_ms.saturating_sub(window_ms);
        w.timestamps.retain(|(ts, _)| *ts >= cutoff);
        w.timestamps.push((now_ms, nonce));
        w.timestamps.len() as u64
    }
}

/// Well-known key builders, matching spec §3 "Ephemeral keys" verbatim.
pub mod keys {
    pub fn ws_auth(device_id: &str) -> String {
        format!("ws:auth:{device_id}")
    }
    pub fn ws_conn(device_id: &str) -> String {
        format!("ws:conn:{device_id}")
    }
    pub fn stream(device_id: &str) -> String {
        format!("stream:{device_id}")
    }
    pub fn enroll(code: &str) -> String {
        format!("enroll:{code}")
    }
    pub fn rate_limit(scope: &str, subject: &str) -> String {
        format!("ratelimit:{scope}:{subject}")
    }
    pub fn geocode(query: &str) -> String {
        format!("ors:geocode:{}", normalize_query(query))
    }
    pub fn autocomplete(query: &str, country: Option<&str>) -> String {
        match country {
            Some(cc) => format!("ors:autocomplete:{}:{cc}", normalize_query(query)),
            None => format!("ors:autocomplete:{}", normalize_query(query)),
        }
    }
    pub fn route_directions(profile: &str, coords: &str) -> String {
        format!("ors:route:{profile}:{coords}")
    }

    /// Case-insensitive, trimmed, per spec testable property 10.
    pub fn normalize_query(query: &str) -> String {
        query.trim().to_lowercase()
    }
}

pub const WS_AUTH_TTL: Duration = Duration::from_secs(900);
pub const WS_CONN_TTL: Duration = Duration::from_secs(120);
pub const ENROLL_TTL: Duration = Duration::from_secs(600);
pub const GEOCODE_TTL: Duration = Duration::from_secs(86_400);
pub const ROUTING_TTL: Duration = Duration::from_secs(3_600);

#[cfg(feature = "redis-store")]
pub mod redis_store {
    //! `redis`-backed adapter, grounded in `foofork-riptidecrawler`'s
    //! `redis = { features = ["tokio-comp"] }` usage. Full sorted-set
    //! sliding-window semantics map onto `ZADD`/`ZREMRANGEBYSCORE`/`ZCARD`;
    //! omitted here beyond the connection scaffold for the same reason as
    //! the postgres adapter: the scheduler and guard depend only on the
    //! `EphemeralStore` trait, never on this implementation.
    use redis::aio::ConnectionManager;

    pub struct RedisEphemeralStore {
        #[allow(dead_code)]
        conn: ConnectionManager,
    }

    impl RedisEphemeralStore {
        pub async fn connect(redis_url: &str) -> Result<Self, crate::error::AppError> {
            let client = redis::Client::open(redis_url)
                .map_err(|e| crate::error::AppError::Internal(format!("redis client: {e}")))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|e| crate::error::AppError::Internal(format!("redis connect: {e}")))?;
            Ok(Self { conn })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = InMemoryEphemeralStore::new();
        store
            .set("k", serde_json::json!({"a": 1}), None)
            .await;
        assert_eq!(store.get("k").await, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn ttl_expires() {
        let store = InMemoryEphemeralStore::new();
        store
            .set("k", serde_json::json!(1), Some(Duration::from_millis(10)))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn sliding_window_counts_and_expires() {
        let store = InMemoryEphemeralStore::new();
        for i in 0..5 {
            store.incr_window("w", i, 1_000, 10_000).await;
        }
        let count = store.incr_window("w", 99, 1_500, 10_000).await;
        assert_eq!(count, 6);
        // well past the window
        let count = store.incr_window("w", 100, 50_000, 10_000).await;
        assert_eq!(count, 1);
    }

    #[test]
    fn geocode_key_normalizes_case_and_whitespace() {
        assert_eq!(keys::geocode("  Istanbul  "), keys::geocode("istanbul"));
    }
}
