use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::models::{RunStatistics, StepPerformance, StepTrace};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_runs))
        .route("/statistics", get(run_statistics))
        .route("/steps/:name", get(step_performance))
        .route("/:id", get(get_run))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub trigger_time: NaiveDateTime,
    pub status: String,
    pub context: serde_json::Value,
    pub opportunities_processed: i64,
    pub notifications_sent: i64,
    pub errors: Vec<String>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: RunResponse,
    pub steps: Vec<StepResponse>,
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub step_name: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration_seconds: f64,
    pub outcome: String,
    pub payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl From<StepTrace> for StepResponse {
    fn from(step: StepTrace) -> Self {
        StepResponse {
            duration_seconds: step.duration_seconds(),
            payload: step
                .payload
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            step_name: step.step_name,
            started_at: step.started_at,
            ended_at: step.ended_at,
            outcome: step.outcome,
            error_message: step.error_message,
        }
    }
}

/// Last N runs, newest first. The dashboard's main table.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> AppResult<Json<Vec<RunResponse>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let runs = state.orchestrator.tracker().recent_runs(limit).await?;
    let items = runs
        .into_iter()
        .map(|run| RunResponse {
            errors: run.error_list(),
            context: run.context_value(),
            id: run.id,
            trigger_time: run.trigger_time,
            status: run.status,
            opportunities_processed: run.opportunities_processed,
            notifications_sent: run.notifications_sent,
            updated_at: run.updated_at,
        })
        .collect();
    Ok(Json(items))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<RunDetailResponse>> {
    let run = crate::db::AgentRunRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run {}", id)))?;
    let steps = state
        .orchestrator
        .tracker()
        .steps_for_run(&id)
        .await?
        .into_iter()
        .map(StepResponse::from)
        .collect();

    Ok(Json(RunDetailResponse {
        run: RunResponse {
            errors: run.error_list(),
            context: run.context_value(),
            id: run.id,
            trigger_time: run.trigger_time,
            status: run.status,
            opportunities_processed: run.opportunities_processed,
            notifications_sent: run.notifications_sent,
            updated_at: run.updated_at,
        },
        steps,
    }))
}

async fn run_statistics(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<RunStatistics>> {
    let stats = state.orchestrator.tracker().get_run_statistics().await?;
    Ok(Json(stats))
}

async fn step_performance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<StepPerformance>> {
    let stats = state
        .orchestrator
        .tracker()
        .get_step_performance(&name)
        .await?;
    Ok(Json(stats))
}
