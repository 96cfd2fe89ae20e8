use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::AppResult;
use crate::services::data::{CacheStatistics, ConsistencyReport};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/statistics", get(statistics))
        .route("/consistency", get(consistency))
        .route("/refresh", post(refresh))
        .route("/clear", post(clear))
}

#[derive(Serialize)]
struct RefreshResponse {
    old_count: u64,
    new_count: u64,
}

#[derive(Serialize)]
struct ClearResponse {
    cleared: u64,
}

async fn statistics(State(state): State<Arc<AppState>>) -> AppResult<Json<CacheStatistics>> {
    Ok(Json(state.data.get_cache_statistics().await?))
}

async fn consistency(State(state): State<Arc<AppState>>) -> AppResult<Json<ConsistencyReport>> {
    Ok(Json(state.data.validate_data_consistency().await?))
}

async fn refresh(State(state): State<Arc<AppState>>) -> AppResult<Json<RefreshResponse>> {
    let (old_count, new_count) = state.data.refresh_cache().await?;
    Ok(Json(RefreshResponse {
        old_count,
        new_count,
    }))
}

async fn clear(State(state): State<Arc<AppState>>) -> AppResult<Json<ClearResponse>> {
    let cleared = state.data.clear_cache().await?;
    Ok(Json(ClearResponse { cleared }))
}
