use chrono::NaiveDateTime;
use sqlx::SqlitePool;

use crate::db::models::CachedOpportunity;
use crate::error::{AppError, AppResult};

/// Repository for the durable opportunity snapshot.
///
/// The cache only ever changes wholesale: a refresh deletes the previous
/// snapshot and inserts the new one inside a single transaction, so readers
/// observe either the old set or the new set, never a mixture.
pub struct OpportunityCacheRepository;

impl OpportunityCacheRepository {
    /// Atomically replace the whole snapshot. Returns (old_count, new_count).
    pub async fn replace_all(
        pool: &SqlitePool,
        rows: &[CachedOpportunity],
    ) -> AppResult<(u64, u64)> {
        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let deleted = sqlx::query("DELETE FROM opportunity_cache")
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?
            .rows_affected();

        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO opportunity_cache (
                    order_num,
                    org_name,
                    name,
                    address,
                    supervisor_name,
                    order_status,
                    create_time,
                    last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.order_num)
            .bind(&row.org_name)
            .bind(&row.name)
            .bind(&row.address)
            .bind(&row.supervisor_name)
            .bind(&row.order_status)
            .bind(row.create_time)
            .bind(row.last_updated)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok((deleted, rows.len() as u64))
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<CachedOpportunity>> {
        let rows = sqlx::query_as::<_, CachedOpportunity>(
            r#"
            SELECT
                order_num,
                org_name,
                name,
                address,
                supervisor_name,
                order_status,
                create_time,
                last_updated
            FROM opportunity_cache
            ORDER BY create_time ASC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn count(pool: &SqlitePool) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunity_cache")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Timestamp of the most recent refresh, if the cache has ever been
    /// populated.
    pub async fn latest_update(pool: &SqlitePool) -> AppResult<Option<NaiveDateTime>> {
        let latest: Option<NaiveDateTime> =
            sqlx::query_scalar("SELECT MAX(last_updated) FROM opportunity_cache")
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(latest)
    }

    pub async fn clear(pool: &SqlitePool) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM opportunity_cache")
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
