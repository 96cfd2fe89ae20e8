use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Missing configuration key: {0}")]
    ConfigMissing(String),

    #[error("Failed to fetch opportunity data: {0}")]
    DataFetch(String),

    #[error("Opportunity cache is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("No webhook configured for {0}")]
    NoWebhook(String),

    #[error("Business logic invariant violated: {0}")]
    BusinessLogic(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Analytics service error: {0}")]
    Analytics(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable kind string recorded into `agent_runs.errors` and surfaced on
    /// the dashboard so operators can tell data-source outages from webhook
    /// outages from logic bugs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigMissing(_) => "ConfigMissing",
            AppError::DataFetch(_) => "DataFetchError",
            AppError::CacheCorrupt(_) => "CacheCorrupt",
            AppError::NoWebhook(_) => "NoWebhook",
            AppError::BusinessLogic(_) => "BusinessLogicError",
            AppError::Cancelled => "Cancelled",
            AppError::NotFound(_) => "NotFound",
            AppError::BadRequest(_) => "BadRequest",
            AppError::Validation(_) => "ValidationError",
            AppError::Database(_) => "DatabaseError",
            AppError::Request(_) => "RequestError",
            AppError::Analytics(_) => "AnalyticsError",
            AppError::Internal(_) => "InternalError",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::ConfigMissing(key) => {
                tracing::error!("Missing configuration key: {}", key);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_MISSING",
                    self.to_string(),
                )
            }
            AppError::DataFetch(msg) => {
                tracing::error!("Data fetch error: {}", msg);
                (StatusCode::BAD_GATEWAY, "DATA_FETCH_ERROR", msg.clone())
            }
            AppError::CacheCorrupt(msg) => {
                tracing::error!("Cache corrupt: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CACHE_CORRUPT",
                    msg.clone(),
                )
            }
            AppError::NoWebhook(target) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NO_WEBHOOK",
                format!("No webhook configured for {}", target),
            ),
            AppError::BusinessLogic(msg) => {
                tracing::error!("Business logic error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BUSINESS_LOGIC_ERROR",
                    msg.clone(),
                )
            }
            AppError::Cancelled => (StatusCode::CONFLICT, "CANCELLED", self.to_string()),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Analytics(msg) => {
                tracing::error!("Analytics service error: {}", msg);
                (StatusCode::BAD_GATEWAY, "ANALYTICS_ERROR", msg.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
