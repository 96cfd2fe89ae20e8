use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateNotificationTask, NotificationTask, NotificationType, TaskStatus};
use crate::error::{AppError, AppResult};

const TASK_COLUMNS: &str = r#"
    id,
    order_num,
    org_name,
    notification_type,
    due_time,
    status,
    message,
    sent_at,
    created_run_id,
    sent_run_id,
    retry_count,
    max_retry_count,
    cooldown_hours,
    last_sent_at,
    created_at,
    updated_at
"#;

/// Repository for the persistent notification task queue.
pub struct NotificationTaskRepository;

impl NotificationTaskRepository {
    /// Insert a new pending task. `max_retry_count` and `cooldown_hours`
    /// fall back to the supplied defaults when the caller leaves them unset.
    pub async fn create(
        pool: &SqlitePool,
        task: CreateNotificationTask,
        default_max_retry: i32,
        default_cooldown_hours: f64,
        now: NaiveDateTime,
    ) -> AppResult<NotificationTask> {
        let id = Uuid::new_v4().to_string();
        let max_retry = task.max_retry_count.unwrap_or(default_max_retry);
        let cooldown = task.cooldown_hours.unwrap_or(default_cooldown_hours);

        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            INSERT INTO notification_tasks (
                id,
                order_num,
                org_name,
                notification_type,
                due_time,
                status,
                message,
                sent_at,
                created_run_id,
                sent_run_id,
                retry_count,
                max_retry_count,
                cooldown_hours,
                last_sent_at,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&task.order_num)
        .bind(&task.org_name)
        .bind(task.notification_type.as_str())
        .bind(task.due_time)
        .bind(TaskStatus::Pending.as_str())
        .bind::<Option<String>>(None) // message
        .bind::<Option<NaiveDateTime>>(None) // sent_at
        .bind(&task.created_run_id)
        .bind::<Option<String>>(None) // sent_run_id
        .bind(0i32)
        .bind(max_retry)
        .bind(cooldown)
        .bind::<Option<NaiveDateTime>>(None) // last_sent_at
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// All pending tasks in dispatch order.
    pub async fn find_pending(pool: &SqlitePool) -> AppResult<Vec<NotificationTask>> {
        let rows = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM notification_tasks
            WHERE status = 'pending'
            ORDER BY due_time ASC, created_at ASC
            "#
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn find_pending_by_key(
        pool: &SqlitePool,
        order_num: &str,
        notification_type: NotificationType,
    ) -> AppResult<Option<NotificationTask>> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM notification_tasks
            WHERE order_num = ? AND notification_type = ? AND status = 'pending'
            "#
        ))
        .bind(order_num)
        .bind(notification_type.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Most recently delivered task for a business key, used for cooldown
    /// decisions.
    pub async fn find_latest_sent_by_key(
        pool: &SqlitePool,
        order_num: &str,
        notification_type: NotificationType,
    ) -> AppResult<Option<NotificationTask>> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM notification_tasks
            WHERE order_num = ? AND notification_type = ? AND status = 'sent'
            ORDER BY last_sent_at DESC
            LIMIT 1
            "#
        ))
        .bind(order_num)
        .bind(notification_type.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Persist the rendered text onto a task, once. The first rendering
    /// wins; later dispatch attempts reuse it.
    pub async fn set_message_if_absent(
        pool: &SqlitePool,
        id: &str,
        message: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE notification_tasks
            SET message = ?, updated_at = ?
            WHERE id = ? AND message IS NULL
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_sent(
        pool: &SqlitePool,
        id: &str,
        run_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<NotificationTask> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            UPDATE notification_tasks
            SET status = 'sent',
                sent_at = ?,
                last_sent_at = ?,
                sent_run_id = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(run_id)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Record a failed delivery attempt: bump `retry_count` and flip the
    /// task to 'failed' once the retry budget is exhausted. `last_sent_at`
    /// is deliberately untouched.
    pub async fn register_failure(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<NotificationTask> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            UPDATE notification_tasks
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retry_count THEN 'failed' ELSE 'pending' END,
                updated_at = ?
            WHERE id = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Permanent failure: no retry budget consultation.
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<NotificationTask> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            UPDATE notification_tasks
            SET status = 'failed', updated_at = ?
            WHERE id = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn cancel(
        pool: &SqlitePool,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<NotificationTask> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            UPDATE notification_tasks
            SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    #[allow(dead_code)]
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<NotificationTask>> {
        let row = sqlx::query_as::<_, NotificationTask>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM notification_tasks
            WHERE id = ?
            "#
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_recent(
        pool: &SqlitePool,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> AppResult<Vec<NotificationTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, NotificationTask>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS}
                    FROM notification_tasks
                    WHERE status = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, NotificationTask>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS}
                    FROM notification_tasks
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#
                ))
                .bind(limit)
                .fetch_all(pool)
                .await
            }
        }
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Delete finished (sent/failed) tasks older than the cutoff. Pending
    /// tasks are never cleaned up automatically.
    pub async fn delete_finished_before(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM notification_tasks
            WHERE status IN ('sent', 'failed') AND created_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    pub async fn count_by_status(pool: &SqlitePool, status: TaskStatus) -> AppResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notification_tasks WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn a_stored_task_reads_back_identically() {
        let pool = crate::services::init::test_pool().await;
        let now = dt(14, 0);

        let created = NotificationTaskRepository::create(
            &pool,
            CreateNotificationTask {
                order_num: "GD2024001".to_string(),
                org_name: "Alpha服务商".to_string(),
                notification_type: NotificationType::Violation,
                due_time: now,
                created_run_id: Some("run-1".to_string()),
                max_retry_count: Some(3),
                cooldown_hours: Some(1.5),
            },
            5,
            2.0,
            now,
        )
        .await
        .unwrap();

        assert_eq!(created.status, "pending");
        assert_eq!(created.retry_count, 0);
        assert_eq!(created.max_retry_count, 3);
        assert_eq!(created.cooldown_hours, 1.5);

        let loaded = NotificationTaskRepository::find_by_id(&pool, &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn a_sent_task_round_trips_with_all_fields() {
        let pool = crate::services::init::test_pool().await;
        let now = dt(14, 0);

        let created = NotificationTaskRepository::create(
            &pool,
            CreateNotificationTask {
                order_num: "GD2024002".to_string(),
                org_name: "Alpha".to_string(),
                notification_type: NotificationType::Standard,
                due_time: now,
                created_run_id: Some("run-1".to_string()),
                max_retry_count: None,
                cooldown_hours: None,
            },
            5,
            2.0,
            now,
        )
        .await
        .unwrap();

        NotificationTaskRepository::set_message_if_absent(&pool, &created.id, "hello", dt(14, 1))
            .await
            .unwrap();
        let sent = NotificationTaskRepository::mark_sent(&pool, &created.id, "run-2", dt(14, 2))
            .await
            .unwrap();

        let loaded = NotificationTaskRepository::find_by_id(&pool, &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, sent);
        assert_eq!(loaded.message.as_deref(), Some("hello"));
        assert_eq!(loaded.sent_at, Some(dt(14, 2)));
        assert_eq!(loaded.last_sent_at, Some(dt(14, 2)));
        assert_eq!(loaded.sent_run_id.as_deref(), Some("run-2"));

        // The first rendering wins; a later attempt cannot overwrite it.
        NotificationTaskRepository::set_message_if_absent(&pool, &created.id, "other", dt(14, 3))
            .await
            .unwrap();
        let unchanged = NotificationTaskRepository::find_by_id(&pool, &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.message.as_deref(), Some("hello"));
    }
}
