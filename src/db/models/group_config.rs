use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Distinguished group that receives escalation notifications.
pub const INTERNAL_OPS_GROUP_ID: &str = "internal_ops";

/// Routing entry: organization name -> chat group webhook.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: String,

    /// Organization name this group belongs to. For the internal ops group
    /// the name is informational only.
    pub name: String,

    pub webhook_url: String,

    pub enabled: bool,

    /// Group-level minimum gap between notifications, in minutes. The
    /// effective cooldown for a task is the maximum of this and the task's
    /// own `cooldown_hours`.
    pub notification_cooldown_minutes: i64,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertGroupConfig {
    pub group_id: String,
    pub name: String,
    pub webhook_url: String,
    pub enabled: bool,
    pub notification_cooldown_minutes: Option<i64>,
}
