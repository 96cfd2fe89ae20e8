use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::AnalyticsConfig;
use crate::db::models::RawOpportunity;
use crate::error::{AppError, AppResult};

/// Read-only view of the analytics service that serves the opportunity
/// report. Behind a trait so runs and tests can inject fakes.
#[async_trait]
pub trait AnalyticsApi: Send + Sync {
    /// Execute the saved question and return its raw rows.
    async fn query_report(&self, report_id: u32) -> AppResult<Vec<RawOpportunity>>;

    /// Cheap connectivity probe for health checks.
    async fn test_connection(&self) -> bool;
}

#[derive(Deserialize)]
struct SessionResponse {
    id: String,
}

/// HTTP client for a Metabase-style question card API.
///
/// Authentication is a session id obtained from `POST /api/session` and sent
/// as the `X-Metabase-Session` header. The session is cached and re-acquired
/// once when the service answers 401.
pub struct AnalyticsClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
}

impl AnalyticsClient {
    pub fn new(config: &AnalyticsConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(AppError::Request)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            session: RwLock::new(None),
        })
    }

    async fn login(&self) -> AppResult<String> {
        let url = format!("{}/api/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(AppError::Request)?;

        if !response.status().is_success() {
            return Err(AppError::Analytics(format!(
                "session login failed with status {}",
                response.status()
            )));
        }

        let session: SessionResponse = response.json().await.map_err(AppError::Request)?;
        *self.session.write().await = Some(session.id.clone());
        tracing::info!("Analytics session established");
        Ok(session.id)
    }

    async fn session_id(&self) -> AppResult<String> {
        if let Some(id) = self.session.read().await.clone() {
            return Ok(id);
        }
        self.login().await
    }

    async fn post_query(
        &self,
        report_id: u32,
        session_id: &str,
    ) -> AppResult<reqwest::Response> {
        let url = format!("{}/api/card/{}/query/json", self.base_url, report_id);
        self.http
            .post(&url)
            .header("X-Metabase-Session", session_id)
            .send()
            .await
            .map_err(AppError::Request)
    }
}

#[async_trait]
impl AnalyticsApi for AnalyticsClient {
    async fn query_report(&self, report_id: u32) -> AppResult<Vec<RawOpportunity>> {
        let session_id = self.session_id().await?;
        let mut response = self.post_query(report_id, &session_id).await?;

        // Expired session: relogin once and retry.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("Analytics session expired, re-authenticating");
            let session_id = self.login().await?;
            response = self.post_query(report_id, &session_id).await?;
        }

        if !response.status().is_success() {
            return Err(AppError::Analytics(format!(
                "report {} query failed with status {}",
                report_id,
                response.status()
            )));
        }

        // The JSON export endpoint returns one object per row keyed by
        // column name. Rows that do not carry the required fields are
        // dropped with a warning rather than failing the whole report.
        let rows: Vec<serde_json::Value> = response.json().await.map_err(AppError::Request)?;
        let mut opportunities = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<RawOpportunity>(row.clone()) {
                Ok(raw) => opportunities.push(raw),
                Err(e) => {
                    tracing::warn!("Dropping malformed report row: {} ({})", e, row);
                }
            }
        }

        tracing::info!(
            "Fetched {} opportunities from report {}",
            opportunities.len(),
            report_id
        );
        Ok(opportunities)
    }

    async fn test_connection(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Analytics health probe failed: {}", e);
                false
            }
        }
    }
}

/// Scripted analytics source for tests: returns programmed rows or a
/// programmed failure, and counts queries.
#[cfg(test)]
pub struct MockAnalytics {
    rows: std::sync::Mutex<AppResult<Vec<RawOpportunity>>>,
    pub queries: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl MockAnalytics {
    pub fn with_rows(rows: Vec<RawOpportunity>) -> Self {
        Self {
            rows: std::sync::Mutex::new(Ok(rows)),
            queries: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            rows: std::sync::Mutex::new(Err(AppError::Analytics(message.to_string()))),
            queries: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn set_rows(&self, rows: Vec<RawOpportunity>) {
        *self.rows.lock().unwrap() = Ok(rows);
    }

    pub fn set_failure(&self, message: &str) {
        *self.rows.lock().unwrap() = Err(AppError::Analytics(message.to_string()));
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl AnalyticsApi for MockAnalytics {
    async fn query_report(&self, _report_id: u32) -> AppResult<Vec<RawOpportunity>> {
        self.queries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match &*self.rows.lock().unwrap() {
            Ok(rows) => Ok(rows.clone()),
            Err(e) => Err(AppError::Analytics(e.to_string())),
        }
    }

    async fn test_connection(&self) -> bool {
        self.rows.lock().unwrap().is_ok()
    }
}
