use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::stats::StatSample;
use crate::AppState;

use super::AppError;

// ─── GET /api/stats/services/*service ────────────────────────────

/// Current LB rows of one service, e.g. `/api/stats/services/api/Hello`.
pub async fn service_stats(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Vec<StatSample>>, AppError> {
    let rows = state.store.service_rows(&service);
    if rows.is_empty() {
        return Err(AppError::NotFound(format!("service '{service}' not found")));
    }
    Ok(Json(rows))
}
