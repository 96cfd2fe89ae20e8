use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::models::{GroupConfig, UpsertGroupConfig};
use crate::db::GroupConfigRepository;
use crate::error::AppResult;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_groups).put(upsert_group))
        .route("/:group_id/enabled", post(set_enabled))
}

async fn list_groups(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<GroupConfig>>> {
    Ok(Json(GroupConfigRepository::list_all(&state.db).await?))
}

/// Create or update the webhook routing for an organization.
async fn upsert_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertGroupConfig>,
) -> AppResult<Json<GroupConfig>> {
    let group = GroupConfigRepository::upsert(&state.db, body, state.clock.now()).await?;
    Ok(Json(group))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

/// Mute or unmute one group without losing its configuration.
async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(body): Json<SetEnabledRequest>,
) -> AppResult<Json<serde_json::Value>> {
    GroupConfigRepository::set_enabled(&state.db, &group_id, body.enabled, state.clock.now())
        .await?;
    Ok(Json(serde_json::json!({
        "group_id": group_id,
        "enabled": body.enabled
    })))
}
