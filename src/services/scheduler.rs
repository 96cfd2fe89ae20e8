use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;

use crate::business_time::Clock;
use crate::error::{AppError, AppResult};
use crate::services::orchestrator::Orchestrator;
use crate::services::settings::{keys, ConfigStore};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_minutes: Option<i64>,
    pub last_tick: Option<NaiveDateTime>,
    /// Projected moment of the next trigger; absent while stopped.
    pub next_tick: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub interval_minutes: i64,
}

struct Worker {
    shutdown: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
    interval_minutes: i64,
    started_at: NaiveDateTime,
}

/// Periodic trigger for the pipeline.
///
/// One background worker at most; ticks that land while a run is still
/// active are skipped with a log instead of queueing up, and missed ticks
/// never backfill.
#[derive(Clone)]
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    settings: ConfigStore,
    clock: Arc<dyn Clock>,
    worker: Arc<RwLock<Option<Worker>>>,
    last_tick: Arc<RwLock<Option<NaiveDateTime>>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: ConfigStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            orchestrator,
            settings,
            clock,
            worker: Arc::new(RwLock::new(None)),
            last_tick: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the periodic worker with the configured interval. Starting an
    /// already started scheduler is an error; use `restart` to pick up an
    /// interval change.
    pub async fn start(&self) -> AppResult<JobInfo> {
        let mut worker_slot = self.worker.write().await;
        if worker_slot.is_some() {
            return Err(AppError::BadRequest("scheduler already running".to_string()));
        }

        let interval_minutes = self.settings.get_int(keys::AGENT_INTERVAL_MINUTES).await?;
        if interval_minutes <= 0 {
            return Err(AppError::Validation(format!(
                "{} must be positive, got {}",
                keys::AGENT_INTERVAL_MINUTES,
                interval_minutes
            )));
        }

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let orchestrator = self.orchestrator.clone();
        let clock = self.clock.clone();
        let last_tick = self.last_tick.clone();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_minutes as u64 * 60));
            // Only the latest missed tick fires; no backfill burst after a
            // stall.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Consume the immediate first tick so the first pass happens one
            // interval from now.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler worker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        *last_tick.write().await = Some(clock.now());

                        if orchestrator.tracker().is_running().await {
                            tracing::warn!(
                                "Previous run still active at tick; skipping this trigger"
                            );
                            continue;
                        }

                        match orchestrator.execute(false, "schedule").await {
                            Ok(summary) if summary.skipped => {
                                tracing::warn!("Scheduled run skipped: {} already active", summary.run_id);
                            }
                            Ok(summary) => {
                                tracing::info!(
                                    "Scheduled run {} finished with status {}",
                                    summary.run_id,
                                    summary.status
                                );
                            }
                            Err(e) => {
                                tracing::error!("Scheduled run failed to execute: {:?}", e);
                            }
                        }
                    }
                }
            }
        });

        *worker_slot = Some(Worker {
            shutdown,
            handle,
            interval_minutes,
            started_at: self.clock.now(),
        });

        tracing::info!("Scheduler started with a {} minute interval", interval_minutes);
        Ok(JobInfo {
            name: "fsoa-pipeline".to_string(),
            interval_minutes,
        })
    }

    /// Stop the worker. In-flight runs finish on their own; only the trigger
    /// loop ends.
    pub async fn stop(&self) -> AppResult<()> {
        let mut worker_slot = self.worker.write().await;
        match worker_slot.take() {
            Some(worker) => {
                // Graceful: an in-flight run finishes, only the trigger loop
                // ends. The handle is dropped detached.
                let _ = worker.shutdown.send(());
                drop(worker.handle);
                tracing::info!("Scheduler stopped");
                Ok(())
            }
            None => Err(AppError::BadRequest("scheduler is not running".to_string())),
        }
    }

    /// Stop and start again, re-reading the interval from settings.
    pub async fn restart(&self) -> AppResult<JobInfo> {
        if self.worker.read().await.is_some() {
            self.stop().await?;
        }
        self.start().await
    }

    /// Run one pass immediately, outside the periodic cadence.
    pub async fn trigger_now(&self, dry_run: bool) -> AppResult<crate::services::orchestrator::RunSummary> {
        self.orchestrator.execute(dry_run, "manual").await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let worker = self.worker.read().await;
        let last_tick = *self.last_tick.read().await;
        // One interval past the newest trigger point. Ticks recorded by an
        // earlier worker incarnation do not count.
        let next_tick = worker.as_ref().map(|w| {
            let base = last_tick
                .filter(|tick| *tick >= w.started_at)
                .unwrap_or(w.started_at);
            base + ChronoDuration::minutes(w.interval_minutes)
        });
        SchedulerStatus {
            running: worker.is_some(),
            interval_minutes: worker.as_ref().map(|w| w.interval_minutes),
            last_tick,
            next_tick,
        }
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        match self.worker.read().await.as_ref() {
            Some(worker) => vec![JobInfo {
                name: "fsoa-pipeline".to_string(),
                interval_minutes: worker.interval_minutes,
            }],
            None => Vec::new(),
        }
    }
}
