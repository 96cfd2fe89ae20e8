use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::business_time::{BusinessCalendar, Clock};
use crate::db::SystemConfigRepository;
use crate::error::{AppError, AppResult};

/// Well-known runtime setting keys.
pub mod keys {
    pub const WORK_START_HOUR: &str = "work_start_hour";
    pub const WORK_END_HOUR: &str = "work_end_hour";
    pub const WORK_DAYS: &str = "work_days";
    pub const CACHE_TTL_HOURS: &str = "cache_ttl_hours";
    pub const AGENT_INTERVAL_MINUTES: &str = "agent_interval_minutes";
    pub const NOTIFICATION_COOLDOWN_HOURS: &str = "notification_cooldown_hours";
    pub const NOTIFICATION_MAX_RETRY: &str = "notification_max_retry";
    pub const ESCALATION_MENTION_USERS: &str = "escalation_mention_users";
    pub const NOTIFICATION_MAX_DISPLAY: &str = "notification_max_display";
}

/// Documented defaults, written on first start for keys that do not exist.
const DEFAULTS: &[(&str, &str, &str)] = &[
    (keys::WORK_START_HOUR, "9", "Business day start hour"),
    (keys::WORK_END_HOUR, "19", "Business day end hour (exclusive)"),
    (keys::WORK_DAYS, "1,2,3,4,5", "Work days, 1=Monday .. 7=Sunday"),
    (keys::CACHE_TTL_HOURS, "1", "Opportunity cache freshness window"),
    (keys::AGENT_INTERVAL_MINUTES, "60", "Scheduler interval"),
    (
        keys::NOTIFICATION_COOLDOWN_HOURS,
        "2.0",
        "Minimum gap between two sends for the same task key",
    ),
    (
        keys::NOTIFICATION_MAX_RETRY,
        "5",
        "Delivery attempts before a task is marked failed",
    ),
    (
        keys::ESCALATION_MENTION_USERS,
        "",
        "Comma separated user ids to @mention on escalations",
    ),
    (
        keys::NOTIFICATION_MAX_DISPLAY,
        "5",
        "Maximum opportunities listed per message",
    ),
];

/// Runtime-tunable settings backed by the `system_config` table.
///
/// Reads go through an in-memory write-through cache so the hot paths do not
/// hit the store for every key. An update takes effect on the next read;
/// there is no subscriber notification.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Write the documented defaults for keys that are still absent.
    pub async fn seed_defaults(&self) -> AppResult<()> {
        let now = self.clock.now();
        for (key, value, description) in DEFAULTS {
            SystemConfigRepository::insert_if_absent(&self.pool, key, value, description, now)
                .await?;
        }
        tracing::info!("Seeded {} default configuration keys", DEFAULTS.len());
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> AppResult<Option<String>> {
        if let Some(value) = self.cache.read().await.get(key) {
            return Ok(Some(value.clone()));
        }

        match SystemConfigRepository::get(&self.pool, key).await? {
            Some(entry) => {
                self.cache
                    .write()
                    .await
                    .insert(key.to_string(), entry.value.clone());
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    pub async fn get_string(&self, key: &str) -> AppResult<String> {
        self.get_raw(key)
            .await?
            .ok_or_else(|| AppError::ConfigMissing(key.to_string()))
    }

    pub async fn get_int(&self, key: &str) -> AppResult<i64> {
        let raw = self.get_string(key).await?;
        raw.trim()
            .parse()
            .map_err(|_| AppError::Validation(format!("{} is not an integer: {:?}", key, raw)))
    }

    pub async fn get_float(&self, key: &str) -> AppResult<f64> {
        let raw = self.get_string(key).await?;
        raw.trim()
            .parse()
            .map_err(|_| AppError::Validation(format!("{} is not a number: {:?}", key, raw)))
    }

    /// Comma separated list of integers; whitespace around items is ignored.
    pub async fn get_csv_int_list(&self, key: &str) -> AppResult<Vec<i64>> {
        let raw = self.get_string(key).await?;
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                item.parse().map_err(|_| {
                    AppError::Validation(format!("{} contains a non-integer: {:?}", key, item))
                })
            })
            .collect()
    }

    /// Comma separated list of strings; empty items are dropped, so an empty
    /// value yields an empty list.
    pub async fn get_csv_string_list(&self, key: &str) -> AppResult<Vec<String>> {
        let raw = self.get_string(key).await?;
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Write-through update: persist first, then refresh the cache entry.
    pub async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let now = self.clock.now();
        SystemConfigRepository::set(&self.pool, key, value, None, now).await?;
        self.cache
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        tracing::info!("Updated configuration {} = {}", key, value);
        Ok(())
    }

    /// Build the work calendar from the current settings.
    pub async fn business_calendar(&self) -> AppResult<BusinessCalendar> {
        let start = self.get_int(keys::WORK_START_HOUR).await? as u32;
        let end = self.get_int(keys::WORK_END_HOUR).await? as u32;
        let days = self
            .get_csv_int_list(keys::WORK_DAYS)
            .await?
            .into_iter()
            .map(|d| d as u32);
        BusinessCalendar::new(start, end, days)
    }
}
