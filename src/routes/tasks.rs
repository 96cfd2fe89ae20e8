use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::models::{NotificationTask, TaskStatus};
use crate::db::NotificationTaskRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tasks))
        .route("/cleanup", post(cleanup_tasks))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> AppResult<Json<Vec<NotificationTask>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status {:?}", raw)))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let tasks = NotificationTaskRepository::list_recent(&state.db, status, limit).await?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub max_age_days: Option<i64>,
}

/// Delete finished tasks past the retention window. Pending tasks are never
/// touched.
async fn cleanup_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let max_age_days = query.max_age_days.unwrap_or(30).max(1);
    let deleted = state.manager.cleanup_old_tasks(max_age_days).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
