use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub database: bool,
    pub analytics: bool,
    pub webhook_configured: bool,
    pub scheduler_running: bool,
}

/// Overall health: degraded when an external dependency is down, unhealthy
/// when the store itself is unreachable.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();
    let analytics = state.analytics.test_connection().await;
    let webhook_configured = state.config.webhook.internal_ops_url.is_some()
        || matches!(
            crate::db::GroupConfigRepository::list_all(&state.db).await,
            Ok(groups) if groups.iter().any(|g| g.enabled)
        );
    let scheduler_running = state.scheduler.status().await.running;

    let status = if database && analytics && webhook_configured {
        "healthy"
    } else if database {
        "degraded"
    } else {
        "unhealthy"
    };

    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: state.clock.now().format("%Y-%m-%d %H:%M:%S").to_string(),
        database,
        analytics,
        webhook_configured,
        scheduler_running,
    };

    (code, Json(response))
}
