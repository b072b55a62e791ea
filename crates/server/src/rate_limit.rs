//! Sliding-window limiter over `EphemeralStore::incr_window` (spec §3
//! `ratelimit:*` sorted-set semantics), consumed by the handlers named in
//! spec §1's out-of-scope list but whose primitive — the window counter —
//! is in scope as part of C4. No rate-limiting crate is introduced; this is
//! the thinnest possible wrapper over the primitive the cache already has.

use crate::state::SharedState;
use gpsfleet_core::cache::{keys, EphemeralStore};
use gpsfleet_core::{AppError, AppResult};
use rand::Rng;

pub async fn check(state: &SharedState, scope: &str, subject: &str, max: u32, window_s: u64) -> AppResult<()> {
    let now_ms = chrono::Utc::now().timestamp_millis() as u64;
    let nonce: u64 = rand::thread_rng().gen();
    let count = state
        .cache
        .incr_window(&keys::rate_limit(scope, subject), nonce, now_ms, window_s * 1000)
        .await;
    if count as u32 > max {
        return Err(AppError::RateLimited { retry_after_s: window_s });
    }
    Ok(())
}
