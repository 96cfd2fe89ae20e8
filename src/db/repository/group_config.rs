use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::{GroupConfig, UpsertGroupConfig};
use crate::error::{AppError, AppResult};

const GROUP_COLUMNS: &str = r#"
    group_id,
    name,
    webhook_url,
    enabled,
    notification_cooldown_minutes,
    created_at,
    updated_at
"#;

pub struct GroupConfigRepository;

impl GroupConfigRepository {
    pub async fn upsert(
        pool: &SqlitePool,
        group: UpsertGroupConfig,
        now: NaiveDateTime,
    ) -> AppResult<GroupConfig> {
        let cooldown = group.notification_cooldown_minutes.unwrap_or(30);

        let row = sqlx::query_as::<_, GroupConfig>(&format!(
            r#"
            INSERT INTO group_config (
                group_id,
                name,
                webhook_url,
                enabled,
                notification_cooldown_minutes,
                created_at,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (group_id) DO UPDATE SET
                name = excluded.name,
                webhook_url = excluded.webhook_url,
                enabled = excluded.enabled,
                notification_cooldown_minutes = excluded.notification_cooldown_minutes,
                updated_at = excluded.updated_at
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(&group.group_id)
        .bind(&group.name)
        .bind(&group.webhook_url)
        .bind(group.enabled)
        .bind(cooldown)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Resolve the routing entry for an organization.
    pub async fn find_by_org_name(
        pool: &SqlitePool,
        org_name: &str,
    ) -> AppResult<Option<GroupConfig>> {
        let row = sqlx::query_as::<_, GroupConfig>(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM group_config
            WHERE name = ?
            "#
        ))
        .bind(org_name)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_group_id(
        pool: &SqlitePool,
        group_id: &str,
    ) -> AppResult<Option<GroupConfig>> {
        let row = sqlx::query_as::<_, GroupConfig>(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM group_config
            WHERE group_id = ?
            "#
        ))
        .bind(group_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<GroupConfig>> {
        let rows = sqlx::query_as::<_, GroupConfig>(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM group_config
            ORDER BY group_id ASC
            "#
        ))
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn set_enabled(
        pool: &SqlitePool,
        group_id: &str,
        enabled: bool,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE group_config SET enabled = ?, updated_at = ? WHERE group_id = ?",
        )
        .bind(enabled)
        .bind(now)
        .bind(group_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("group {}", group_id)));
        }

        Ok(())
    }
}
