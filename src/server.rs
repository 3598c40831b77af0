use axum::{middleware as axum_mw, routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::aggregation::stream;
use crate::handlers;
use crate::middleware::timing;
use crate::AppState;

/// Builds the dashboard `Router`: JSON snapshots and the SSE push stream.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Aggregated stats ────────────────────────────────────
        .route("/api/stats", get(stream::get_stats))
        .route("/api/stats/stream", get(stream::stats_stream))
        .route(
            "/api/stats/services/*service",
            get(handlers::stats::service_stats),
        )
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}
