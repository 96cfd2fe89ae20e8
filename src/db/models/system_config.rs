use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One runtime-tunable setting, persisted in `system_config`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}
