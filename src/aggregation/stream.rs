use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use super::{AggregationStore, StatsPayload};
use crate::AppState;

// ─── GET /api/stats ──────────────────────────────────────────────
/// Returns a single JSON snapshot — useful for curl / debugging.

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsPayload> {
    Json(state.store.snapshot())
}

// ─── GET /api/stats/stream ───────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the current snapshot as soon as the client connects, then once
/// per window rotation for as long as the client stays attached.

pub async fn stats_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = payload_stream(state.store.clone())
        .map(|json| Ok(Event::default().data(json)));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Serialized snapshots: one right away, then one per rotation.
/// A snapshot that fails to serialize is skipped; the next rotation retries.
pub fn payload_stream(store: Arc<AggregationStore>) -> impl Stream<Item = String> {
    WatchStream::new(store.subscribe()).filter_map(move |rotation| {
        match serde_json::to_string(&store.snapshot()) {
            Ok(json) => Some(json),
            Err(err) => {
                warn!(rotation, %err, "skipping stats export");
                None
            }
        }
    })
}
