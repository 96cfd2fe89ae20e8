use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::services::orchestrator::RunSummary;
use crate::services::scheduler::{JobInfo, SchedulerStatus};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/jobs", get(jobs))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/trigger", post(trigger))
        .route("/cancel", post(cancel))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
    pub run_active: bool,
    pub current_run: Option<String>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let tracker = state.orchestrator.tracker();
    Json(StatusResponse {
        scheduler: state.scheduler.status().await,
        run_active: tracker.is_running().await,
        current_run: tracker.current_run().await,
    })
}

async fn jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobInfo>> {
    Json(state.scheduler.list_jobs().await)
}

async fn start(State(state): State<Arc<AppState>>) -> AppResult<Json<JobInfo>> {
    Ok(Json(state.scheduler.start().await?))
}

async fn stop(State(state): State<Arc<AppState>>) -> AppResult<Json<SchedulerStatus>> {
    state.scheduler.stop().await?;
    Ok(Json(state.scheduler.status().await))
}

async fn restart(State(state): State<Arc<AppState>>) -> AppResult<Json<JobInfo>> {
    Ok(Json(state.scheduler.restart().await?))
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    #[serde(default)]
    pub dry_run: bool,
}

/// Kick one pass outside the periodic cadence.
async fn trigger(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> AppResult<Json<RunSummary>> {
    Ok(Json(state.scheduler.trigger_now(query.dry_run).await?))
}

/// Request cancellation of the run in flight; observed between steps.
async fn cancel(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.orchestrator.cancel_current();
    Json(serde_json::json!({ "cancelled": true }))
}
