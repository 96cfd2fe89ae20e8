use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::models::Opportunity;
use crate::error::AppResult;
use crate::services::sla::SlaThresholds;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_opportunities))
        .route("/overdue", get(list_overdue))
        .route("/approaching", get(list_approaching))
}

#[derive(Debug, Deserialize)]
pub struct OpportunitiesQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct OpportunityResponse {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    /// Wall-clock moment the standard SLA threshold lands, projected through
    /// the work calendar. Absent for non-monitored statuses.
    pub sla_deadline: Option<NaiveDateTime>,
}

async fn with_deadlines(
    state: &Arc<AppState>,
    opportunities: Vec<Opportunity>,
) -> AppResult<Vec<OpportunityResponse>> {
    let calendar = state.settings.business_calendar().await?;
    Ok(opportunities
        .into_iter()
        .map(|opportunity| {
            let sla_deadline = SlaThresholds::for_status(&opportunity.status).map(|thresholds| {
                calendar.add_business_hours(opportunity.create_time, thresholds.standard_hours)
            });
            OpportunityResponse {
                opportunity,
                sla_deadline,
            }
        })
        .collect())
}

async fn list_opportunities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> AppResult<Json<Vec<OpportunityResponse>>> {
    let opportunities = state.data.get_all_opportunities(query.force_refresh).await?;
    Ok(Json(with_deadlines(&state, opportunities).await?))
}

async fn list_overdue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> AppResult<Json<Vec<OpportunityResponse>>> {
    let opportunities = state
        .data
        .get_overdue_opportunities(query.force_refresh)
        .await?;
    Ok(Json(with_deadlines(&state, opportunities).await?))
}

async fn list_approaching(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<OpportunityResponse>>> {
    let opportunities = state.data.get_approaching_overdue_opportunities().await?;
    Ok(Json(with_deadlines(&state, opportunities).await?))
}
