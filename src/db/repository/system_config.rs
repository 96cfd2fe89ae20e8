use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::SystemConfigEntry;
use crate::error::{AppError, AppResult};

pub struct SystemConfigRepository;

impl SystemConfigRepository {
    pub async fn get(pool: &SqlitePool, key: &str) -> AppResult<Option<SystemConfigEntry>> {
        let row = sqlx::query_as::<_, SystemConfigEntry>(
            r#"
            SELECT key, value, description, created_at
            FROM system_config
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn set(
        pool: &SqlitePool,
        key: &str,
        value: &str,
        description: Option<&str>,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value, description, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                description = COALESCE(excluded.description, system_config.description)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Seed helper: writes the value only when the key does not exist yet,
    /// so operator overrides survive restarts.
    pub async fn insert_if_absent(
        pool: &SqlitePool,
        key: &str,
        value: &str,
        description: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value, description, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<SystemConfigEntry>> {
        let rows = sqlx::query_as::<_, SystemConfigEntry>(
            r#"
            SELECT key, value, description, created_at
            FROM system_config
            ORDER BY key ASC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
