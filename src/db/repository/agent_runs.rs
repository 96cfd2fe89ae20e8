use chrono::NaiveDateTime;
use sqlx::{Row, SqlitePool};

use crate::db::models::{
    AgentRun, RunStatistics, RunStatus, StepOutcome, StepPerformance, StepTrace,
};
use crate::error::{AppError, AppResult};

const RUN_COLUMNS: &str = r#"
    id,
    trigger_time,
    status,
    context,
    opportunities_processed,
    notifications_sent,
    errors,
    created_at,
    updated_at
"#;

const STEP_COLUMNS: &str = r#"
    id,
    run_id,
    step_name,
    started_at,
    ended_at,
    outcome,
    payload,
    error_message,
    created_at
"#;

/// Repository for run records (`agent_runs`) and their step traces
/// (`agent_history`).
pub struct AgentRunRepository;

impl AgentRunRepository {
    pub async fn create(
        pool: &SqlitePool,
        id: &str,
        trigger_time: NaiveDateTime,
        context: &serde_json::Value,
    ) -> AppResult<AgentRun> {
        let context_json = serde_json::to_string(context)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize run context: {}", e)))?;

        let row = sqlx::query_as::<_, AgentRun>(&format!(
            r#"
            INSERT INTO agent_runs (
                id,
                trigger_time,
                status,
                context,
                opportunities_processed,
                notifications_sent,
                errors,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, 0, 0, '[]', ?, ?)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(trigger_time)
        .bind(RunStatus::Running.as_str())
        .bind(context_json)
        .bind(trigger_time)
        .bind(trigger_time)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn complete(
        pool: &SqlitePool,
        id: &str,
        opportunities_processed: i64,
        notifications_sent: i64,
        now: NaiveDateTime,
    ) -> AppResult<AgentRun> {
        let row = sqlx::query_as::<_, AgentRun>(&format!(
            r#"
            UPDATE agent_runs
            SET status = ?,
                opportunities_processed = ?,
                notifications_sent = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(RunStatus::Completed.as_str())
        .bind(opportunities_processed)
        .bind(notifications_sent)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn fail(
        pool: &SqlitePool,
        id: &str,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<AgentRun> {
        Self::append_error(pool, id, error, now).await?;

        let row = sqlx::query_as::<_, AgentRun>(&format!(
            r#"
            UPDATE agent_runs
            SET status = ?, updated_at = ?
            WHERE id = ?
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(RunStatus::Failed.as_str())
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Append one error string to the run's `errors` JSON array. Runs have a
    /// single writer, so read-modify-write is safe here.
    pub async fn append_error(
        pool: &SqlitePool,
        id: &str,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        let current: Option<String> = sqlx::query_scalar("SELECT errors FROM agent_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        let current = current.ok_or_else(|| AppError::NotFound(format!("run {}", id)))?;
        let mut errors: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
        errors.push(error.to_string());
        let updated = serde_json::to_string(&errors)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("serialize run errors: {}", e)))?;

        sqlx::query("UPDATE agent_runs SET errors = ?, updated_at = ? WHERE id = ?")
            .bind(updated)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<AgentRun>> {
        let row = sqlx::query_as::<_, AgentRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM agent_runs
            WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_recent(pool: &SqlitePool, limit: i64) -> AppResult<Vec<AgentRun>> {
        let rows = sqlx::query_as::<_, AgentRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM agent_runs
            ORDER BY trigger_time DESC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn statistics(pool: &SqlitePool) -> AppResult<RunStatistics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_runs,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS successful_runs,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_runs,
                COALESCE(
                    AVG(
                        CASE WHEN status != 'running'
                            THEN (julianday(updated_at) - julianday(trigger_time)) * 86400.0
                        END
                    ),
                    0.0
                ) AS average_duration_seconds
            FROM agent_runs
            "#,
        )
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(RunStatistics {
            total_runs: row.get("total_runs"),
            successful_runs: row.get("successful_runs"),
            failed_runs: row.get("failed_runs"),
            average_duration_seconds: row.get("average_duration_seconds"),
        })
    }

    pub async fn insert_step(
        pool: &SqlitePool,
        run_id: &str,
        step_name: &str,
        started_at: NaiveDateTime,
        ended_at: NaiveDateTime,
        outcome: StepOutcome,
        payload: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> AppResult<StepTrace> {
        let payload_json = match payload {
            Some(value) => Some(serde_json::to_string(value).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("serialize step payload: {}", e))
            })?),
            None => None,
        };

        let row = sqlx::query_as::<_, StepTrace>(&format!(
            r#"
            INSERT INTO agent_history (
                run_id,
                step_name,
                started_at,
                ended_at,
                outcome,
                payload,
                error_message,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(step_name)
        .bind(started_at)
        .bind(ended_at)
        .bind(outcome.as_str())
        .bind(payload_json)
        .bind(error_message)
        .bind(ended_at)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn steps_for_run(pool: &SqlitePool, run_id: &str) -> AppResult<Vec<StepTrace>> {
        let rows = sqlx::query_as::<_, StepTrace>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM agent_history
            WHERE run_id = ?
            ORDER BY id ASC
            "#
        ))
        .bind(run_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn step_performance(
        pool: &SqlitePool,
        step_name: &str,
    ) -> AppResult<StepPerformance> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN outcome = 'completed' THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(
                    AVG((julianday(ended_at) - julianday(started_at)) * 86400.0),
                    0.0
                ) AS average_duration_seconds
            FROM agent_history
            WHERE step_name = ?
            "#,
        )
        .bind(step_name)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(StepPerformance {
            step_name: step_name.to_string(),
            total: row.get("total"),
            successful: row.get("successful"),
            average_duration_seconds: row.get("average_duration_seconds"),
        })
    }
}
