use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Synthetic `order_num` prefix for per-organization escalation tasks.
///
/// Escalation tasks are aggregated per organization, not per order, so they
/// store `ESCALATION_<org_name>` in the column that otherwise holds a real
/// order number. The pending-key unique index then enforces at most one
/// pending escalation per organization.
pub const ESCALATION_KEY_PREFIX: &str = "ESCALATION_";

pub fn escalation_key(org_name: &str) -> String {
    format!("{}{}", ESCALATION_KEY_PREFIX, org_name)
}

/// Kind of outbound message a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Response-time SLA breached (first threshold).
    Violation,
    /// Standard SLA breached (the order is overdue).
    Standard,
    /// Escalation threshold breached; routed to the internal ops channel.
    Escalation,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Violation => "violation",
            NotificationType::Standard => "standard",
            NotificationType::Escalation => "escalation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "violation" => Some(NotificationType::Violation),
            "standard" => Some(NotificationType::Standard),
            "escalation" => Some(NotificationType::Escalation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskStatus::Pending),
            "sent" => Some(TaskStatus::Sent),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// One outbound message unit, persisted in `notification_tasks`.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationTask {
    /// Primary key (UUID)
    pub id: String,

    /// Business key: a real order number, or `ESCALATION_<org_name>` for
    /// aggregated escalation tasks.
    pub order_num: String,

    pub org_name: String,

    /// 'violation', 'standard' or 'escalation'.
    pub notification_type: String,

    /// When the task becomes eligible for dispatch.
    pub due_time: NaiveDateTime,

    /// 'pending', 'sent', 'failed' or 'cancelled'.
    pub status: String,

    /// The exact text that was sent. Filled right before the first webhook
    /// call and immutable afterwards, so failed sends stay diagnosable.
    pub message: Option<String>,

    pub sent_at: Option<NaiveDateTime>,

    /// Run that created the task / run that finally sent it.
    pub created_run_id: Option<String>,
    pub sent_run_id: Option<String>,

    pub retry_count: i32,
    pub max_retry_count: i32,

    /// Minimum gap between two successful sends for the same key, in hours.
    /// The group-level cooldown may extend it.
    pub cooldown_hours: f64,

    /// Set only on successful delivery; a failed attempt leaves it alone so
    /// cooldown never suppresses retries of an undelivered message.
    pub last_sent_at: Option<NaiveDateTime>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl NotificationTask {
    pub fn task_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn task_type(&self) -> Option<NotificationType> {
        NotificationType::parse(&self.notification_type)
    }
}

/// Data required to insert a new pending task. Retry and cooldown knobs
/// default from system configuration when omitted.
#[derive(Debug, Clone)]
pub struct CreateNotificationTask {
    pub order_num: String,
    pub org_name: String,
    pub notification_type: NotificationType,
    pub due_time: NaiveDateTime,
    pub created_run_id: Option<String>,
    pub max_retry_count: Option<i32>,
    pub cooldown_hours: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_key_embeds_org_name() {
        assert_eq!(escalation_key("Alpha"), "ESCALATION_Alpha");
    }

    #[test]
    fn type_and_status_round_trip() {
        for t in [
            NotificationType::Violation,
            NotificationType::Standard,
            NotificationType::Escalation,
        ] {
            assert_eq!(NotificationType::parse(t.as_str()), Some(t));
        }
        for s in [
            TaskStatus::Pending,
            TaskStatus::Sent,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(NotificationType::parse("bogus"), None);
    }
}
