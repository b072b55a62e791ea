//! Liveness and metrics exposition (spec §6 `/health`, `/metrics`). No
//! metrics crate is introduced: the Prometheus text format is assembled by
//! hand from the scheduler's atomic counters, mirroring the flat-text
//! `/health` handler style the teacher's `dispatch` binary uses.

use crate::state::SharedState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::atomic::Ordering;

pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let active = state.control.list_active().await.len();
    let body = serde_json::json!({
        "status": "ok",
        "activeStreams": active,
    });
    (StatusCode::OK, axum::Json(body))
}

pub async fn metrics(State(state): State<SharedState>) -> Response {
    let counters = &state.scheduler.counters;
    let body = format!(
        "# HELP gpsfleet_ticks_emitted_total Total simulation ticks emitted.\n\
         # TYPE gpsfleet_ticks_emitted_total counter\n\
         gpsfleet_ticks_emitted_total {}\n\
         # HELP gpsfleet_ticks_skipped_total Total simulation ticks skipped due to backpressure.\n\
         # TYPE gpsfleet_ticks_skipped_total counter\n\
         gpsfleet_ticks_skipped_total {}\n\
         # HELP gpsfleet_streams_started_total Total streams started.\n\
         # TYPE gpsfleet_streams_started_total counter\n\
         gpsfleet_streams_started_total {}\n\
         # HELP gpsfleet_anti_teleport_events_total Total anti-teleport corrections applied.\n\
         # TYPE gpsfleet_anti_teleport_events_total counter\n\
         gpsfleet_anti_teleport_events_total {}\n\
         # HELP gpsfleet_auto_pauses_total Total auto-pauses triggered by the backpressure guard.\n\
         # TYPE gpsfleet_auto_pauses_total counter\n\
         gpsfleet_auto_pauses_total {}\n",
        counters.ticks_emitted.load(Ordering::Relaxed),
        counters.ticks_skipped.load(Ordering::Relaxed),
        counters.streams_started.load(Ordering::Relaxed),
        counters.anti_teleport_events.load(Ordering::Relaxed),
        counters.auto_pauses.load(Ordering::Relaxed),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
