use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::db::models::Opportunity;
use crate::error::{AppError, AppResult};
use crate::services::data::{DataStrategy, FetchOutcome};
use crate::services::notifications::{DispatchSummary, NotificationManager};
use crate::services::tracker::ExecutionTracker;
use crate::services::webhook::{NoopWebhook, WebhookSender};

/// Outcome of one orchestrated pass, for callers (CLI, API, scheduler).
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    /// True when another run was active and this pass did nothing.
    pub skipped: bool,
    pub dry_run: bool,
    pub opportunities_processed: i64,
    pub notifications_sent: i64,
    pub dispatch: Option<DispatchSummary>,
    pub errors: Vec<String>,
}

#[derive(Serialize)]
struct FetchStep {
    count: usize,
    stale: bool,
    #[serde(skip)]
    outcome: FetchOutcome,
}

#[derive(Serialize)]
struct EvaluateStep {
    total: usize,
    monitored: usize,
    violations: usize,
    overdue: usize,
    escalations: usize,
    #[serde(skip)]
    opportunities: Vec<Opportunity>,
}

#[derive(Serialize)]
struct CreateStep {
    created: usize,
}

/// Composes one run: start tracking, refresh data, evaluate, create tasks,
/// dispatch, finish. All component calls are sequential; the tracker's gate
/// keeps the whole pipeline single-flight process-wide.
pub struct Orchestrator {
    data: Arc<DataStrategy>,
    manager: Arc<NotificationManager>,
    tracker: ExecutionTracker,
    webhook: Arc<dyn WebhookSender>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        data: Arc<DataStrategy>,
        manager: Arc<NotificationManager>,
        tracker: ExecutionTracker,
        webhook: Arc<dyn WebhookSender>,
    ) -> Self {
        Self {
            data,
            manager,
            tracker,
            webhook,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Request cancellation of the run in flight. Observed between steps;
    /// in-flight I/O completes first.
    pub fn cancel_current(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn ensure_not_cancelled(&self) -> AppResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Execute one pass. A dry run swaps in the no-op webhook transport; the
    /// fetch, evaluation and task-creation paths are identical to a real
    /// run, and the run is recorded either way.
    pub async fn execute(&self, dry_run: bool, trigger: &str) -> AppResult<RunSummary> {
        let start = self
            .tracker
            .start(serde_json::json!({ "dry_run": dry_run, "trigger": trigger }))
            .await?;
        if start.already_running {
            return Ok(RunSummary {
                run_id: start.run_id,
                status: "running".to_string(),
                skipped: true,
                dry_run,
                opportunities_processed: 0,
                notifications_sent: 0,
                dispatch: None,
                errors: Vec::new(),
            });
        }

        self.cancel.store(false, Ordering::SeqCst);
        let run_id = start.run_id;

        match self.run_pipeline(&run_id, dry_run).await {
            Ok((processed, dispatch)) => {
                let run = self
                    .tracker
                    .complete(&run_id, processed, dispatch.sent_count as i64)
                    .await?;
                Ok(RunSummary {
                    run_id,
                    errors: run.error_list(),
                    status: run.status,
                    skipped: false,
                    dry_run,
                    opportunities_processed: run.opportunities_processed,
                    notifications_sent: run.notifications_sent,
                    dispatch: Some(dispatch),
                })
            }
            Err(e) => {
                let run = self.tracker.fail(&run_id, &e).await?;
                Ok(RunSummary {
                    run_id,
                    errors: run.error_list(),
                    status: run.status,
                    skipped: false,
                    dry_run,
                    opportunities_processed: run.opportunities_processed,
                    notifications_sent: run.notifications_sent,
                    dispatch: None,
                })
            }
        }
    }

    async fn run_pipeline(
        &self,
        run_id: &str,
        dry_run: bool,
    ) -> AppResult<(i64, DispatchSummary)> {
        // Step 1: forced cache refresh, degrading to the stale snapshot.
        self.ensure_not_cancelled()?;
        let fetch = {
            let data = self.data.clone();
            self.tracker
                .track_step(run_id, "fetch_data", move || async move {
                    let outcome = data.fetch(true).await?;
                    Ok(FetchStep {
                        count: outcome.opportunities.len(),
                        stale: outcome.stale,
                        outcome,
                    })
                })
                .await?
        };
        if let Some(degradation) = &fetch.outcome.degradation {
            self.tracker.record_error(run_id, degradation).await?;
        }

        // Step 2: classification sanity pass over the evaluated set.
        self.ensure_not_cancelled()?;
        let evaluation = {
            let opportunities = fetch.outcome.opportunities;
            self.tracker
                .track_step(run_id, "evaluate", move || async move {
                    evaluate_step(opportunities)
                })
                .await?
        };
        let processed = evaluation.total as i64;

        // Step 3: task creation with dedup, cooldown and aggregation.
        self.ensure_not_cancelled()?;
        let opportunities = evaluation.opportunities;
        let created = {
            let manager = self.manager.clone();
            let opportunities = opportunities.clone();
            let created_run_id = run_id.to_string();
            self.tracker
                .track_step(run_id, "create_tasks", move || async move {
                    let created = manager.create_tasks(&opportunities, &created_run_id).await?;
                    Ok(CreateStep {
                        created: created.len(),
                    })
                })
                .await?
        };
        tracing::debug!("Run {}: {} tasks created", run_id, created.created);

        // Step 4: dispatch (suppressed transport on dry runs).
        self.ensure_not_cancelled()?;
        let dispatch = {
            let manager = self.manager.clone();
            let webhook = self.webhook.clone();
            let dispatch_run_id = run_id.to_string();
            self.tracker
                .track_step(run_id, "dispatch", move || async move {
                    let sender: &dyn WebhookSender = if dry_run {
                        &NoopWebhook
                    } else {
                        webhook.as_ref()
                    };
                    manager
                        .execute_tasks(&dispatch_run_id, &opportunities, sender)
                        .await
                })
                .await?
        };

        for error in &dispatch.errors {
            self.tracker.record_error(run_id, error).await?;
        }

        Ok((processed, dispatch))
    }
}

/// Pure evaluation summary plus the invariant gate: a nonsensical derived
/// value aborts the run before any task is touched.
fn evaluate_step(opportunities: Vec<Opportunity>) -> AppResult<EvaluateStep> {
    for opp in &opportunities {
        if opp.elapsed_business_hours < 0.0 || !opp.sla_progress_ratio.is_finite() {
            return Err(AppError::BusinessLogic(format!(
                "opportunity {} has invalid derived fields (elapsed={}, ratio={})",
                opp.order_num, opp.elapsed_business_hours, opp.sla_progress_ratio
            )));
        }
    }

    let total = opportunities.len();
    let mut monitored = 0;
    let mut violations = 0;
    let mut overdue = 0;
    let mut escalations = 0;
    for opp in opportunities.iter().filter(|o| o.status.is_monitored()) {
        monitored += 1;
        violations += usize::from(opp.is_violation);
        overdue += usize::from(opp.is_overdue);
        escalations += usize::from(opp.escalation_level > 0);
    }

    Ok(EvaluateStep {
        total,
        monitored,
        violations,
        overdue,
        escalations,
        opportunities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business_time::{Clock, FixedClock};
    use crate::db::models::{RawOpportunity, TaskStatus, UpsertGroupConfig};
    use crate::db::{GroupConfigRepository, NotificationTaskRepository};
    use crate::services::analytics::{AnalyticsApi, MockAnalytics};
    use crate::services::settings::ConfigStore;
    use crate::services::webhook::MockWebhook;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn raw(order_num: &str, org: &str, create_time: &str) -> RawOpportunity {
        RawOpportunity {
            order_num: order_num.to_string(),
            name: format!("customer-{}", order_num),
            address: String::new(),
            supervisor_name: "王五".to_string(),
            create_time: create_time.to_string(),
            order_status: "待预约".to_string(),
            org_name: org.to_string(),
        }
    }

    struct Fixture {
        pool: sqlx::SqlitePool,
        orchestrator: Orchestrator,
        analytics: Arc<MockAnalytics>,
        webhook: Arc<MockWebhook>,
        clock: Arc<FixedClock>,
    }

    async fn fixture(rows: Vec<RawOpportunity>, at: NaiveDateTime) -> Fixture {
        let pool = crate::services::init::test_pool().await;
        let clock = Arc::new(FixedClock::new(at));
        let settings = ConfigStore::new(pool.clone(), clock.clone());
        settings.seed_defaults().await.unwrap();
        let analytics = Arc::new(MockAnalytics::with_rows(rows));
        let data = Arc::new(DataStrategy::new(
            pool.clone(),
            analytics.clone(),
            settings.clone(),
            clock.clone(),
            1,
            8,
        ));
        let manager = Arc::new(NotificationManager::new(
            pool.clone(),
            settings,
            clock.clone(),
            Some("http://chat.example/ops".to_string()),
        ));
        let tracker = ExecutionTracker::new(pool.clone(), clock.clone());
        let webhook = Arc::new(MockWebhook::sending());
        let orchestrator = Orchestrator::new(data, manager, tracker, webhook.clone());

        GroupConfigRepository::upsert(
            &pool,
            UpsertGroupConfig {
                group_id: "g-alpha".to_string(),
                name: "Alpha".to_string(),
                webhook_url: "http://chat.example/alpha".to_string(),
                enabled: true,
                notification_cooldown_minutes: None,
            },
            clock.now(),
        )
        .await
        .unwrap();

        Fixture {
            pool,
            orchestrator,
            analytics,
            webhook,
            clock,
        }
    }

    #[tokio::test]
    async fn healthy_opportunity_completes_without_notifications() {
        // Monday 10:00, one opportunity created at 09:00.
        let f = fixture(
            vec![raw("GD001", "Alpha", "2024-01-01 09:00:00")],
            dt(2024, 1, 1, 10, 0),
        )
        .await;

        let summary = f.orchestrator.execute(false, "manual").await.unwrap();
        assert_eq!(summary.status, "completed");
        assert!(!summary.skipped);
        assert_eq!(summary.opportunities_processed, 1);
        assert_eq!(summary.notifications_sent, 0);
        assert_eq!(f.webhook.call_count(), 0);

        let steps = f
            .orchestrator
            .tracker()
            .steps_for_run(&summary.run_id)
            .await
            .unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["fetch_data", "evaluate", "create_tasks", "dispatch"]
        );
    }

    #[tokio::test]
    async fn violation_is_notified_then_suppressed_by_cooldown() {
        // Tuesday 14:00; opportunity created Monday 10:00 = 14 business hours.
        let f = fixture(
            vec![raw("GD001", "Alpha", "2024-01-01 10:00:00")],
            dt(2024, 1, 2, 14, 0),
        )
        .await;

        let summary = f.orchestrator.execute(false, "manual").await.unwrap();
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.notifications_sent, 1);
        assert_eq!(f.webhook.call_count(), 1);
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Sent)
                .await
                .unwrap(),
            1
        );

        // One hour later (cooldown 2h): nothing new goes out.
        f.clock.advance_hours(1.0);
        let second = f.orchestrator.execute(false, "schedule").await.unwrap();
        assert_eq!(second.status, "completed");
        assert_eq!(second.notifications_sent, 0);
        assert_eq!(f.webhook.call_count(), 1);
    }

    #[tokio::test]
    async fn analytics_outage_serves_stale_cache_and_records_the_error() {
        let f = fixture(
            (0..10)
                .map(|i| raw(&format!("GD{:03}", i), "Alpha", "2024-01-01 09:00:00"))
                .collect(),
            dt(2024, 1, 1, 10, 0),
        )
        .await;

        // Prime the cache with a healthy run.
        let first = f.orchestrator.execute(false, "manual").await.unwrap();
        assert_eq!(first.status, "completed");

        // Half an hour later the source is down.
        f.analytics.set_failure("connection refused");
        f.clock.advance_hours(0.5);

        let summary = f.orchestrator.execute(false, "schedule").await.unwrap();
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.opportunities_processed, 10);
        assert!(summary
            .errors
            .iter()
            .any(|e| e.contains("DataFetchError")));
    }

    #[tokio::test]
    async fn outage_without_cache_fails_the_run() {
        let f = fixture(vec![], dt(2024, 1, 1, 10, 0)).await;
        f.analytics.set_failure("connection refused");

        let summary = f.orchestrator.execute(false, "manual").await.unwrap();
        assert_eq!(summary.status, "failed");
        assert!(summary
            .errors
            .iter()
            .any(|e| e.contains("DataFetchError")));
        // The gate is released for the next run.
        assert!(!f.orchestrator.tracker().is_running().await);
    }

    #[tokio::test]
    async fn dry_run_creates_tasks_but_suppresses_the_webhook() {
        let f = fixture(
            vec![raw("GD001", "Alpha", "2024-01-01 10:00:00")],
            dt(2024, 1, 2, 14, 0),
        )
        .await;

        let summary = f.orchestrator.execute(true, "manual").await.unwrap();
        assert_eq!(summary.status, "completed");
        assert!(summary.dry_run);
        // Task creation ran for real; the transport was the no-op.
        assert_eq!(summary.notifications_sent, 1);
        assert_eq!(f.webhook.call_count(), 0);
    }

    #[tokio::test]
    async fn second_pass_is_skipped_while_a_run_is_active() {
        let f = fixture(
            vec![raw("GD001", "Alpha", "2024-01-01 09:00:00")],
            dt(2024, 1, 1, 10, 0),
        )
        .await;

        let held = f
            .orchestrator
            .tracker()
            .start(serde_json::json!({"trigger": "test"}))
            .await
            .unwrap();
        assert!(!held.already_running);

        let summary = f.orchestrator.execute(false, "schedule").await.unwrap();
        assert!(summary.skipped);
        assert_eq!(summary.run_id, held.run_id);
    }

    /// Analytics source that requests cancellation while the fetch step is
    /// in flight; the orchestrator must observe it before the next step.
    struct CancellingAnalytics {
        inner: MockAnalytics,
        cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AnalyticsApi for CancellingAnalytics {
        async fn query_report(&self, report_id: u32) -> AppResult<Vec<RawOpportunity>> {
            self.cancel.store(true, Ordering::SeqCst);
            self.inner.query_report(report_id).await
        }

        async fn test_connection(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn cancellation_between_steps_fails_the_run_and_keeps_tasks() {
        let pool = crate::services::init::test_pool().await;
        let clock = Arc::new(FixedClock::new(dt(2024, 1, 2, 14, 0)));
        let settings = ConfigStore::new(pool.clone(), clock.clone());
        settings.seed_defaults().await.unwrap();

        let cancel_signal = Arc::new(AtomicBool::new(false));
        let analytics = Arc::new(CancellingAnalytics {
            inner: MockAnalytics::with_rows(vec![raw("GD001", "Alpha", "2024-01-01 10:00:00")]),
            cancel: cancel_signal.clone(),
        });
        let data = Arc::new(DataStrategy::new(
            pool.clone(),
            analytics,
            settings.clone(),
            clock.clone(),
            1,
            8,
        ));
        let manager = Arc::new(NotificationManager::new(
            pool.clone(),
            settings,
            clock.clone(),
            None,
        ));
        let tracker = ExecutionTracker::new(pool.clone(), clock.clone());
        let webhook = Arc::new(MockWebhook::sending());
        let orchestrator = Orchestrator::new(data, manager, tracker, webhook.clone());
        // Wire the external signal to the orchestrator's flag.
        let orchestrator = Orchestrator {
            cancel: cancel_signal,
            ..orchestrator
        };

        let summary = orchestrator.execute(false, "manual").await.unwrap();
        assert_eq!(summary.status, "failed");
        assert!(summary.errors.iter().any(|e| e.contains("Cancelled")));
        // No tasks were created or mutated.
        assert_eq!(
            NotificationTaskRepository::find_pending(&pool).await.unwrap().len(),
            0
        );
        assert_eq!(webhook.call_count(), 0);
    }
}
