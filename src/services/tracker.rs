use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::business_time::Clock;
use crate::db::models::{AgentRun, RunStatistics, StepOutcome, StepPerformance, StepTrace};
use crate::db::AgentRunRepository;
use crate::error::{AppError, AppResult};

/// Result of asking the tracker to start a run.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub run_id: String,
    /// True when another run was already active; no new record was created
    /// and `run_id` is the active run's id.
    pub already_running: bool,
}

/// Records run lifecycles and per-step traces, and enforces the
/// one-run-at-a-time gate for the whole process.
#[derive(Clone)]
pub struct ExecutionTracker {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    current: Arc<Mutex<Option<String>>>,
}

impl ExecutionTracker {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin a run, unless one is active: concurrent starts observe the
    /// existing run id and do not create a second record.
    pub async fn start(&self, context: serde_json::Value) -> AppResult<StartOutcome> {
        let mut current = self.current.lock().await;
        if let Some(run_id) = current.as_ref() {
            tracing::warn!("Run {} still active; not starting another", run_id);
            return Ok(StartOutcome {
                run_id: run_id.clone(),
                already_running: true,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        AgentRunRepository::create(&self.pool, &run_id, now, &context).await?;
        *current = Some(run_id.clone());

        tracing::info!("Run {} started", run_id);
        Ok(StartOutcome {
            run_id,
            already_running: false,
        })
    }

    /// Execute one step under tracing: the step's duration and outcome (or
    /// error kind + message) are persisted, and errors propagate unchanged.
    pub async fn track_step<T, F, Fut>(&self, run_id: &str, step_name: &str, f: F) -> AppResult<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let started_at = self.clock.now();
        tracing::debug!("Step {} started", step_name);
        let result = f().await;
        let ended_at = self.clock.now();

        match &result {
            Ok(output) => {
                let payload = serde_json::to_value(output).ok();
                AgentRunRepository::insert_step(
                    &self.pool,
                    run_id,
                    step_name,
                    started_at,
                    ended_at,
                    StepOutcome::Completed,
                    payload.as_ref(),
                    None,
                )
                .await?;
            }
            Err(e) => {
                let message = format!("{}: {}", e.kind(), e);
                AgentRunRepository::insert_step(
                    &self.pool,
                    run_id,
                    step_name,
                    started_at,
                    ended_at,
                    StepOutcome::Failed,
                    None,
                    Some(&message),
                )
                .await?;
            }
        }

        result
    }

    /// Record a degraded-path error without failing the run.
    pub async fn record_error(&self, run_id: &str, error: &str) -> AppResult<()> {
        AgentRunRepository::append_error(&self.pool, run_id, error, self.clock.now()).await
    }

    pub async fn complete(
        &self,
        run_id: &str,
        opportunities_processed: i64,
        notifications_sent: i64,
    ) -> AppResult<AgentRun> {
        let run = AgentRunRepository::complete(
            &self.pool,
            run_id,
            opportunities_processed,
            notifications_sent,
            self.clock.now(),
        )
        .await?;
        self.release(run_id).await;
        tracing::info!(
            "Run {} completed: {} opportunities, {} notifications",
            run_id,
            opportunities_processed,
            notifications_sent
        );
        Ok(run)
    }

    pub async fn fail(&self, run_id: &str, error: &AppError) -> AppResult<AgentRun> {
        let message = format!("{}: {}", error.kind(), error);
        let run = AgentRunRepository::fail(&self.pool, run_id, &message, self.clock.now()).await?;
        self.release(run_id).await;
        tracing::error!("Run {} failed: {}", run_id, message);
        Ok(run)
    }

    async fn release(&self, run_id: &str) {
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(run_id) {
            *current = None;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }

    pub async fn current_run(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    pub async fn get_run_statistics(&self) -> AppResult<RunStatistics> {
        AgentRunRepository::statistics(&self.pool).await
    }

    pub async fn get_step_performance(&self, step_name: &str) -> AppResult<StepPerformance> {
        AgentRunRepository::step_performance(&self.pool, step_name).await
    }

    pub async fn recent_runs(&self, limit: i64) -> AppResult<Vec<AgentRun>> {
        AgentRunRepository::list_recent(&self.pool, limit).await
    }

    pub async fn steps_for_run(&self, run_id: &str) -> AppResult<Vec<StepTrace>> {
        AgentRunRepository::steps_for_run(&self.pool, run_id).await
    }
}
