use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::business_time::Clock;
use crate::db::models::{CachedOpportunity, Opportunity, RawOpportunity};
use crate::db::OpportunityCacheRepository;
use crate::error::{AppError, AppResult};
use crate::services::analytics::AnalyticsApi;
use crate::services::settings::{keys, ConfigStore};
use crate::services::sla::SlaEvaluator;

/// Explicit cache statistics record for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub cache_enabled: bool,
    pub cache_ttl_hours: f64,
    pub total_cached: i64,
    pub valid_cached: i64,
    pub overdue_cached: i64,
    pub organizations: i64,
    pub cache_hit_ratio: f64,
    pub stale: bool,
}

/// Result of comparing the cache against a fresh report fetch.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub data_consistent: bool,
    pub cached_count: usize,
    pub fresh_count: usize,
    pub missing_in_cache: Vec<String>,
    pub extra_in_cache: Vec<String>,
}

/// One answered fetch: evaluated opportunities plus degradation facts the
/// orchestrator records into the run.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub opportunities: Vec<Opportunity>,
    pub stale: bool,
    /// Set when the analytics source failed and the stale cache was served
    /// instead; carries the error kind and message for the run record.
    pub degradation: Option<String>,
}

/// Parse the report's `createTime` into business wall-clock time.
///
/// Plain timestamps are taken as already being in the business timezone;
/// ISO-8601 values with an offset are converted exactly once, here at the
/// ingestion boundary.
pub fn parse_business_create_time(raw: &str, tz_offset_hours: i32) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        let offset = FixedOffset::east_opt(tz_offset_hours * 3600)?;
        return Some(parsed.with_timezone(&offset).naive_local());
    }
    None
}

/// Cached-first access to the opportunity report.
///
/// The strategy owns the `opportunity_cache` table: fetches are answered
/// from the cache while it is fresh, refreshes replace the snapshot
/// wholesale, and an analytics outage degrades to the stale snapshot
/// instead of silently serving nothing.
pub struct DataStrategy {
    pool: SqlitePool,
    analytics: Arc<dyn AnalyticsApi>,
    settings: ConfigStore,
    clock: Arc<dyn Clock>,
    report_id: u32,
    tz_offset_hours: i32,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicBool,
}

impl DataStrategy {
    pub fn new(
        pool: SqlitePool,
        analytics: Arc<dyn AnalyticsApi>,
        settings: ConfigStore,
        clock: Arc<dyn Clock>,
        report_id: u32,
        tz_offset_hours: i32,
    ) -> Self {
        Self {
            pool,
            analytics,
            settings,
            clock,
            report_id,
            tz_offset_hours,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicBool::new(false),
        }
    }

    async fn evaluator(&self) -> AppResult<SlaEvaluator> {
        Ok(SlaEvaluator::new(self.settings.business_calendar().await?))
    }

    fn ingest(&self, raw: Vec<RawOpportunity>, now: NaiveDateTime) -> Vec<CachedOpportunity> {
        let mut rows = Vec::with_capacity(raw.len());
        for record in raw {
            match parse_business_create_time(&record.create_time, self.tz_offset_hours) {
                Some(create_time) => rows.push(CachedOpportunity {
                    order_num: record.order_num,
                    org_name: record.org_name,
                    name: record.name,
                    address: record.address,
                    supervisor_name: record.supervisor_name,
                    order_status: record.order_status,
                    create_time,
                    last_updated: now,
                }),
                None => {
                    tracing::warn!(
                        "Dropping opportunity {} with malformed createTime {:?}",
                        record.order_num,
                        record.create_time
                    );
                }
            }
        }
        rows
    }

    async fn cache_is_fresh(&self, ttl_hours: f64) -> AppResult<bool> {
        if ttl_hours <= 0.0 {
            return Ok(false);
        }
        let latest = OpportunityCacheRepository::latest_update(&self.pool).await?;
        match latest {
            Some(last_updated) => {
                let age_hours =
                    (self.clock.now() - last_updated).num_seconds() as f64 / 3600.0;
                Ok(age_hours < ttl_hours)
            }
            None => Ok(false),
        }
    }

    /// Fetch the report and atomically replace the cache snapshot.
    /// Returns (old_count, new_count).
    pub async fn refresh_cache(&self) -> AppResult<(u64, u64)> {
        let raw = self
            .analytics
            .query_report(self.report_id)
            .await
            .map_err(|e| AppError::DataFetch(e.to_string()))?;

        let now = self.clock.now();
        let rows = self.ingest(raw, now);
        let (old_count, new_count) =
            OpportunityCacheRepository::replace_all(&self.pool, &rows).await?;
        self.stale.store(false, Ordering::SeqCst);

        tracing::info!(
            "Opportunity cache refreshed: {} -> {} rows",
            old_count,
            new_count
        );
        Ok((old_count, new_count))
    }

    pub async fn clear_cache(&self) -> AppResult<u64> {
        let cleared = OpportunityCacheRepository::clear(&self.pool).await?;
        tracing::info!("Opportunity cache cleared: {} rows", cleared);
        Ok(cleared)
    }

    /// Load cached rows, recovering once from a corrupt snapshot by
    /// clearing and refetching.
    async fn load_cached_rows(&self) -> AppResult<Vec<CachedOpportunity>> {
        match OpportunityCacheRepository::list_all(&self.pool).await {
            Ok(rows) => Ok(rows),
            Err(AppError::Database(e)) => {
                tracing::warn!("Opportunity cache unreadable ({}), rebuilding", e);
                OpportunityCacheRepository::clear(&self.pool)
                    .await
                    .map_err(|e| AppError::CacheCorrupt(e.to_string()))?;
                self.refresh_cache()
                    .await
                    .map_err(|e| AppError::CacheCorrupt(e.to_string()))?;
                OpportunityCacheRepository::list_all(&self.pool).await
            }
            Err(e) => Err(e),
        }
    }

    /// Core fetch: serve the fresh cache, otherwise refresh; degrade to the
    /// stale snapshot when the source is down and a snapshot exists.
    pub async fn fetch(&self, force_refresh: bool) -> AppResult<FetchOutcome> {
        let ttl_hours = self.settings.get_float(keys::CACHE_TTL_HOURS).await?;
        let fresh = !force_refresh && self.cache_is_fresh(ttl_hours).await?;

        let mut degradation = None;
        if fresh {
            self.hits.fetch_add(1, Ordering::SeqCst);
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.refresh_cache().await {
                let cached = OpportunityCacheRepository::count(&self.pool).await?;
                if cached > 0 {
                    tracing::warn!(
                        "Analytics fetch failed ({}), serving {} stale cached opportunities",
                        e,
                        cached
                    );
                    self.stale.store(true, Ordering::SeqCst);
                    degradation = Some(format!("{}: {}", e.kind(), e));
                } else {
                    // No snapshot to fall back to; never hand back an empty
                    // set as if the source were healthy.
                    return Err(e);
                }
            }
        }

        let rows = self.load_cached_rows().await?;
        let evaluator = self.evaluator().await?;
        let now = self.clock.now();

        Ok(FetchOutcome {
            opportunities: evaluator.evaluate_all(&rows, now),
            stale: self.stale.load(Ordering::SeqCst),
            degradation,
        })
    }

    pub async fn get_all_opportunities(&self, force_refresh: bool) -> AppResult<Vec<Opportunity>> {
        Ok(self.fetch(force_refresh).await?.opportunities)
    }

    pub async fn get_overdue_opportunities(
        &self,
        force_refresh: bool,
    ) -> AppResult<Vec<Opportunity>> {
        let mut opportunities = self.get_all_opportunities(force_refresh).await?;
        opportunities.retain(|o| o.is_overdue);
        Ok(opportunities)
    }

    /// Opportunities at 80%..100% of the standard SLA budget.
    pub async fn get_approaching_overdue_opportunities(&self) -> AppResult<Vec<Opportunity>> {
        let mut opportunities = self.get_all_opportunities(false).await?;
        opportunities.retain(|o| o.is_approaching_overdue());
        Ok(opportunities)
    }

    pub async fn get_cache_statistics(&self) -> AppResult<CacheStatistics> {
        let ttl_hours = self.settings.get_float(keys::CACHE_TTL_HOURS).await?;
        let rows = OpportunityCacheRepository::list_all(&self.pool).await?;
        let evaluator = self.evaluator().await?;
        let now = self.clock.now();

        let valid_cached = match OpportunityCacheRepository::latest_update(&self.pool).await? {
            Some(last_updated)
                if (now - last_updated).num_seconds() as f64 / 3600.0 < ttl_hours =>
            {
                rows.len() as i64
            }
            _ => 0,
        };

        let evaluated = evaluator.evaluate_all(&rows, now);
        let overdue_cached = evaluated.iter().filter(|o| o.is_overdue).count() as i64;
        let organizations = {
            let mut orgs: Vec<&str> = rows.iter().map(|r| r.org_name.as_str()).collect();
            orgs.sort_unstable();
            orgs.dedup();
            orgs.len() as i64
        };

        let hits = self.hits.load(Ordering::SeqCst);
        let misses = self.misses.load(Ordering::SeqCst);
        let lookups = hits + misses;
        let cache_hit_ratio = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        Ok(CacheStatistics {
            cache_enabled: ttl_hours > 0.0,
            cache_ttl_hours: ttl_hours,
            total_cached: rows.len() as i64,
            valid_cached,
            overdue_cached,
            organizations,
            cache_hit_ratio,
            stale: self.stale.load(Ordering::SeqCst),
        })
    }

    /// Compare the cached snapshot against a fresh report fetch without
    /// touching the cache.
    pub async fn validate_data_consistency(&self) -> AppResult<ConsistencyReport> {
        let raw = self
            .analytics
            .query_report(self.report_id)
            .await
            .map_err(|e| AppError::DataFetch(e.to_string()))?;
        let now = self.clock.now();
        let fresh = self.ingest(raw, now);
        let cached = OpportunityCacheRepository::list_all(&self.pool).await?;

        let fresh_keys: std::collections::BTreeSet<&str> =
            fresh.iter().map(|r| r.order_num.as_str()).collect();
        let cached_keys: std::collections::BTreeSet<&str> =
            cached.iter().map(|r| r.order_num.as_str()).collect();

        let missing_in_cache: Vec<String> = fresh_keys
            .difference(&cached_keys)
            .map(|k| k.to_string())
            .collect();
        let extra_in_cache: Vec<String> = cached_keys
            .difference(&fresh_keys)
            .map(|k| k.to_string())
            .collect();

        Ok(ConsistencyReport {
            data_consistent: missing_in_cache.is_empty() && extra_in_cache.is_empty(),
            cached_count: cached.len(),
            fresh_count: fresh.len(),
            missing_in_cache,
            extra_in_cache,
        })
    }
}
