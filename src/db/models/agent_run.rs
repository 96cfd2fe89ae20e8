use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// One scheduled (or manually triggered) execution of the pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AgentRun {
    /// Primary key (UUID)
    pub id: String,

    pub trigger_time: NaiveDateTime,

    /// 'running', 'completed' or 'failed'.
    pub status: String,

    /// Arbitrary JSON map recorded at start (trigger source, dry_run, ...).
    pub context: String,

    pub opportunities_processed: i64,
    pub notifications_sent: i64,

    /// JSON array of error strings accumulated during the run.
    pub errors: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl AgentRun {
    pub fn error_list(&self) -> Vec<String> {
        serde_json::from_str(&self.errors).unwrap_or_default()
    }

    pub fn context_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.context).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Completed => "completed",
            StepOutcome::Failed => "failed",
        }
    }
}

/// One sub-operation of a run, persisted in `agent_history`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StepTrace {
    pub id: i64,
    pub run_id: String,
    pub step_name: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    /// 'completed' or 'failed'.
    pub outcome: String,
    /// JSON snapshot of the step output, when the step produced one.
    pub payload: Option<String>,
    /// Error kind + message when the step failed.
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

impl StepTrace {
    pub fn duration_seconds(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Aggregate over all recorded runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub average_duration_seconds: f64,
}

/// Aggregate over all traces of one step name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPerformance {
    pub step_name: String,
    pub total: i64,
    pub successful: i64,
    pub average_duration_seconds: f64,
}
