use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;

use crate::db::models::SystemConfigEntry;
use crate::db::SystemConfigRepository;
use crate::error::AppResult;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_settings))
        .route("/:key", put(update_setting))
}

async fn list_settings(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<SystemConfigEntry>>> {
    Ok(Json(SystemConfigRepository::list_all(&state.db).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub value: String,
}

/// Update one runtime setting. Takes effect on the next read; the scheduler
/// needs a restart to pick up a new interval.
async fn update_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<UpdateSettingRequest>,
) -> AppResult<Json<serde_json::Value>> {
    state.settings.set(&key, &body.value).await?;
    Ok(Json(serde_json::json!({ "key": key, "value": body.value })))
}
