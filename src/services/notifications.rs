use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::business_time::Clock;
use crate::db::models::{
    escalation_key, CreateNotificationTask, GroupConfig, NotificationTask, NotificationType,
    Opportunity, TaskStatus, INTERNAL_OPS_GROUP_ID,
};
use crate::db::{GroupConfigRepository, NotificationTaskRepository};
use crate::error::AppResult;
use crate::services::formatter::MessageFormatter;
use crate::services::settings::{keys, ConfigStore};
use crate::services::webhook::{DispatchOutcome, WebhookSender};

/// Aggregate result of one dispatch pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub sent_count: usize,
    pub failed_count: usize,
    pub escalated_count: usize,
    pub errors: Vec<String>,
}

/// Owns the lifecycle of notification tasks: creation with dedup and
/// cooldown, per-organization escalation aggregation, grouped dispatch with
/// retry bookkeeping, and cleanup.
pub struct NotificationManager {
    pool: SqlitePool,
    settings: ConfigStore,
    clock: Arc<dyn Clock>,
    /// Fallback escalation webhook from process config, used when no
    /// internal-ops group row exists.
    internal_ops_webhook: Option<String>,
}

impl NotificationManager {
    pub fn new(
        pool: SqlitePool,
        settings: ConfigStore,
        clock: Arc<dyn Clock>,
        internal_ops_webhook: Option<String>,
    ) -> Self {
        Self {
            pool,
            settings,
            clock,
            internal_ops_webhook,
        }
    }

    /// Propose tasks for a batch of evaluated opportunities.
    ///
    /// Per opportunity: a violation task when the response SLA is breached
    /// and a standard task when it is overdue. Escalating opportunities
    /// additionally roll up into at most one escalation task per
    /// organization. Creation is idempotent: an existing pending task or a
    /// recent send for the same key suppresses the proposal.
    pub async fn create_tasks(
        &self,
        opportunities: &[Opportunity],
        run_id: &str,
    ) -> AppResult<Vec<NotificationTask>> {
        let default_cooldown = self
            .settings
            .get_float(keys::NOTIFICATION_COOLDOWN_HOURS)
            .await?;
        let default_max_retry =
            self.settings.get_int(keys::NOTIFICATION_MAX_RETRY).await? as i32;

        let mut created = Vec::new();
        let mut escalating_orgs: BTreeSet<&str> = BTreeSet::new();

        for opp in opportunities.iter().filter(|o| o.status.is_monitored()) {
            if opp.is_violation {
                if let Some(task) = self
                    .create_if_absent(
                        &opp.order_num,
                        &opp.org_name,
                        NotificationType::Violation,
                        run_id,
                        default_max_retry,
                        default_cooldown,
                    )
                    .await?
                {
                    created.push(task);
                }
            }

            if opp.is_overdue {
                if let Some(task) = self
                    .create_if_absent(
                        &opp.order_num,
                        &opp.org_name,
                        NotificationType::Standard,
                        run_id,
                        default_max_retry,
                        default_cooldown,
                    )
                    .await?
                {
                    created.push(task);
                }
            }

            if opp.escalation_level > 0 {
                escalating_orgs.insert(opp.org_name.as_str());
            }
        }

        for org_name in escalating_orgs {
            let key = escalation_key(org_name);
            if let Some(task) = self
                .create_if_absent(
                    &key,
                    org_name,
                    NotificationType::Escalation,
                    run_id,
                    default_max_retry,
                    default_cooldown,
                )
                .await?
            {
                created.push(task);
            }
        }

        if !created.is_empty() {
            tracing::info!("Created {} notification tasks", created.len());
        }
        Ok(created)
    }

    async fn create_if_absent(
        &self,
        order_num: &str,
        org_name: &str,
        notification_type: NotificationType,
        run_id: &str,
        default_max_retry: i32,
        default_cooldown: f64,
    ) -> AppResult<Option<NotificationTask>> {
        if NotificationTaskRepository::find_pending_by_key(&self.pool, order_num, notification_type)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let now = self.clock.now();
        if let Some(sent) = NotificationTaskRepository::find_latest_sent_by_key(
            &self.pool,
            order_num,
            notification_type,
        )
        .await?
        {
            if let Some(last_sent_at) = sent.last_sent_at {
                let cooldown = self
                    .effective_cooldown_hours(sent.cooldown_hours, notification_type, org_name)
                    .await?;
                let since_hours = (now - last_sent_at).num_seconds() as f64 / 3600.0;
                if since_hours < cooldown {
                    tracing::debug!(
                        "Cooldown suppresses {} {} ({:.2}h < {:.2}h)",
                        order_num,
                        notification_type.as_str(),
                        since_hours,
                        cooldown
                    );
                    return Ok(None);
                }
            }
        }

        let task = NotificationTaskRepository::create(
            &self.pool,
            CreateNotificationTask {
                order_num: order_num.to_string(),
                org_name: org_name.to_string(),
                notification_type,
                due_time: now,
                created_run_id: Some(run_id.to_string()),
                max_retry_count: None,
                cooldown_hours: None,
            },
            default_max_retry,
            default_cooldown,
            now,
        )
        .await?;

        Ok(Some(task))
    }

    /// Effective cooldown is the stricter of the task-level and group-level
    /// settings.
    async fn effective_cooldown_hours(
        &self,
        task_cooldown_hours: f64,
        notification_type: NotificationType,
        org_name: &str,
    ) -> AppResult<f64> {
        let group = match notification_type {
            NotificationType::Escalation => {
                GroupConfigRepository::find_by_group_id(&self.pool, INTERNAL_OPS_GROUP_ID).await?
            }
            _ => GroupConfigRepository::find_by_org_name(&self.pool, org_name).await?,
        };

        let group_hours = group
            .map(|g| g.notification_cooldown_minutes as f64 / 60.0)
            .unwrap_or(0.0);
        Ok(task_cooldown_hours.max(group_hours))
    }

    /// Dispatch all pending tasks in (due_time, created_at) order, batching
    /// one webhook call per (organization, type) group. Failures in one
    /// group never halt the others.
    pub async fn execute_tasks(
        &self,
        run_id: &str,
        opportunities: &[Opportunity],
        webhook: &dyn WebhookSender,
    ) -> AppResult<DispatchSummary> {
        let pending = NotificationTaskRepository::find_pending(&self.pool).await?;
        let mut summary = DispatchSummary {
            total: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        let max_display =
            self.settings.get_int(keys::NOTIFICATION_MAX_DISPLAY).await? as usize;
        let mention_users = self
            .settings
            .get_csv_string_list(keys::ESCALATION_MENTION_USERS)
            .await?;
        let formatter = MessageFormatter::new(max_display);

        let by_order: HashMap<&str, &Opportunity> = opportunities
            .iter()
            .map(|o| (o.order_num.as_str(), o))
            .collect();
        let mut escalating_by_org: HashMap<&str, Vec<&Opportunity>> = HashMap::new();
        for opp in opportunities.iter().filter(|o| o.escalation_level > 0) {
            escalating_by_org
                .entry(opp.org_name.as_str())
                .or_default()
                .push(opp);
        }

        // Group in first-seen order so the (due_time, created_at) ordering
        // of the pending queue carries over to group processing.
        let mut group_index: HashMap<(String, String), usize> = HashMap::new();
        let mut groups: Vec<((String, NotificationType), Vec<NotificationTask>)> = Vec::new();
        for task in pending {
            let Some(notification_type) = task.task_type() else {
                tracing::warn!(
                    "Task {} has unknown notification type {:?}",
                    task.id,
                    task.notification_type
                );
                continue;
            };
            let key = (task.org_name.clone(), task.notification_type.clone());
            match group_index.get(&key) {
                Some(&i) => groups[i].1.push(task),
                None => {
                    group_index.insert(key, groups.len());
                    groups.push(((task.org_name.clone(), notification_type), vec![task]));
                }
            }
        }

        for ((org_name, notification_type), tasks) in groups {
            match self
                .dispatch_group(
                    run_id,
                    &org_name,
                    notification_type,
                    tasks,
                    &by_order,
                    &escalating_by_org,
                    &formatter,
                    &mention_users,
                    webhook,
                    &mut summary,
                )
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    // Per-group isolation: record and move on.
                    let message =
                        format!("{} {}: {}", org_name, notification_type.as_str(), e.kind());
                    tracing::error!("Dispatch group failed: {}", message);
                    summary.errors.push(message);
                }
            }
        }

        tracing::info!(
            "Dispatch pass: {} pending, {} sent, {} failed, {} escalated",
            summary.total,
            summary.sent_count,
            summary.failed_count,
            summary.escalated_count
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_group(
        &self,
        run_id: &str,
        org_name: &str,
        notification_type: NotificationType,
        tasks: Vec<NotificationTask>,
        by_order: &HashMap<&str, &Opportunity>,
        escalating_by_org: &HashMap<&str, Vec<&Opportunity>>,
        formatter: &MessageFormatter,
        mention_users: &[String],
        webhook: &dyn WebhookSender,
        summary: &mut DispatchSummary,
    ) -> AppResult<()> {
        let now = self.clock.now();

        // Resolve the destination webhook.
        let webhook_url = match self.resolve_webhook(org_name, notification_type).await? {
            WebhookResolution::Url(url) => url,
            WebhookResolution::Disabled => {
                // Operator muted this group: retire the tasks quietly.
                for task in &tasks {
                    NotificationTaskRepository::cancel(&self.pool, &task.id, now).await?;
                }
                tracing::info!(
                    "Group {} is disabled; cancelled {} {} tasks",
                    org_name,
                    tasks.len(),
                    notification_type.as_str()
                );
                return Ok(());
            }
            WebhookResolution::Missing => {
                for task in &tasks {
                    NotificationTaskRepository::mark_failed(&self.pool, &task.id, now).await?;
                }
                summary.failed_count += tasks.len();
                // Surfaces in the run errors as the NoWebhook kind; sibling
                // groups keep dispatching.
                return Err(crate::error::AppError::NoWebhook(org_name.to_string()));
            }
        };

        // Collect the opportunities behind this group; tasks whose
        // opportunity left the monitored set are moot and get cancelled.
        let mut live_tasks = Vec::new();
        let mut listed: Vec<Opportunity> = Vec::new();
        match notification_type {
            NotificationType::Escalation => {
                let escalating = escalating_by_org.get(org_name).cloned().unwrap_or_default();
                if escalating.is_empty() {
                    for task in &tasks {
                        NotificationTaskRepository::cancel(&self.pool, &task.id, now).await?;
                    }
                    tracing::info!(
                        "No escalating opportunities left for {}; cancelled escalation task",
                        org_name
                    );
                    return Ok(());
                }
                listed = escalating.into_iter().cloned().collect();
                live_tasks = tasks;
            }
            _ => {
                for task in tasks {
                    match by_order.get(task.order_num.as_str()) {
                        Some(opp) => {
                            listed.push((*opp).clone());
                            live_tasks.push(task);
                        }
                        None => {
                            tracing::info!(
                                "Opportunity {} no longer reported; cancelling task {}",
                                task.order_num,
                                task.id
                            );
                            NotificationTaskRepository::cancel(&self.pool, &task.id, now).await?;
                        }
                    }
                }
                if live_tasks.is_empty() {
                    return Ok(());
                }
            }
        }

        let (text, mentions): (String, &[String]) = match notification_type {
            NotificationType::Escalation => (
                formatter.format_escalation_notification(org_name, &listed, mention_users, now),
                mention_users,
            ),
            _ => (
                formatter.format_group_notification(org_name, notification_type, &listed, now),
                &[],
            ),
        };

        // Persist the rendered text before the call so a failed send stays
        // diagnosable.
        for task in &live_tasks {
            NotificationTaskRepository::set_message_if_absent(&self.pool, &task.id, &text, now)
                .await?;
        }

        match webhook.post(&webhook_url, &text, mentions).await {
            DispatchOutcome::Sent => {
                for task in &live_tasks {
                    NotificationTaskRepository::mark_sent(&self.pool, &task.id, run_id, now)
                        .await?;
                }
                summary.sent_count += live_tasks.len();
                if notification_type == NotificationType::Escalation {
                    summary.escalated_count += live_tasks.len();
                }
            }
            DispatchOutcome::Transient(reason) => {
                for task in &live_tasks {
                    let updated =
                        NotificationTaskRepository::register_failure(&self.pool, &task.id, now)
                            .await?;
                    if updated.task_status() == Some(TaskStatus::Failed) {
                        summary.failed_count += 1;
                        tracing::warn!(
                            "Task {} exhausted its retry budget ({})",
                            updated.id,
                            updated.max_retry_count
                        );
                    }
                }
                summary.errors.push(format!(
                    "{} {}: transient failure: {}",
                    org_name,
                    notification_type.as_str(),
                    reason
                ));
            }
            DispatchOutcome::Permanent(reason) => {
                for task in &live_tasks {
                    NotificationTaskRepository::mark_failed(&self.pool, &task.id, now).await?;
                }
                summary.failed_count += live_tasks.len();
                summary.errors.push(format!(
                    "{} {}: permanent failure: {}",
                    org_name,
                    notification_type.as_str(),
                    reason
                ));
            }
        }

        Ok(())
    }

    async fn resolve_webhook(
        &self,
        org_name: &str,
        notification_type: NotificationType,
    ) -> AppResult<WebhookResolution> {
        let group: Option<GroupConfig> = match notification_type {
            NotificationType::Escalation => {
                GroupConfigRepository::find_by_group_id(&self.pool, INTERNAL_OPS_GROUP_ID).await?
            }
            _ => GroupConfigRepository::find_by_org_name(&self.pool, org_name).await?,
        };

        match group {
            Some(group) if group.enabled => Ok(WebhookResolution::Url(group.webhook_url)),
            Some(_) => Ok(WebhookResolution::Disabled),
            None if notification_type == NotificationType::Escalation => {
                match &self.internal_ops_webhook {
                    Some(url) => Ok(WebhookResolution::Url(url.clone())),
                    None => Ok(WebhookResolution::Missing),
                }
            }
            None => Ok(WebhookResolution::Missing),
        }
    }

    /// Remove finished tasks older than the cutoff. Pending tasks are kept
    /// regardless of age.
    pub async fn cleanup_old_tasks(&self, max_age_days: i64) -> AppResult<u64> {
        let cutoff = self.clock.now() - Duration::days(max_age_days);
        let deleted =
            NotificationTaskRepository::delete_finished_before(&self.pool, cutoff).await?;
        if deleted > 0 {
            tracing::info!(
                "Cleaned up {} finished notification tasks older than {} days",
                deleted,
                max_age_days
            );
        }
        Ok(deleted)
    }
}

enum WebhookResolution {
    Url(String),
    Disabled,
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business_time::{BusinessCalendar, FixedClock};
    use crate::db::models::UpsertGroupConfig;
    use crate::db::models::{CachedOpportunity, TaskStatus};
    use crate::services::sla::SlaEvaluator;
    use crate::services::webhook::MockWebhook;
    use chrono::{NaiveDate, NaiveDateTime};

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    struct Fixture {
        pool: sqlx::SqlitePool,
        manager: NotificationManager,
        clock: Arc<FixedClock>,
    }

    async fn fixture(at: NaiveDateTime) -> Fixture {
        let pool = crate::services::init::test_pool().await;
        let clock = Arc::new(FixedClock::new(at));
        let settings = ConfigStore::new(pool.clone(), clock.clone());
        settings.seed_defaults().await.unwrap();
        let manager =
            NotificationManager::new(pool.clone(), settings, clock.clone(), None);
        Fixture {
            pool,
            manager,
            clock,
        }
    }

    async fn add_group(f: &Fixture, group_id: &str, org: &str, url: &str, enabled: bool) {
        GroupConfigRepository::upsert(
            &f.pool,
            UpsertGroupConfig {
                group_id: group_id.to_string(),
                name: org.to_string(),
                webhook_url: url.to_string(),
                enabled,
                notification_cooldown_minutes: None,
            },
            f.clock.now(),
        )
        .await
        .unwrap();
    }

    /// Evaluate one synthetic opportunity at the fixture clock.
    fn opportunity(
        order_num: &str,
        org: &str,
        status: &str,
        create_time: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Opportunity {
        let evaluator = SlaEvaluator::new(BusinessCalendar::default());
        evaluator.evaluate(
            &CachedOpportunity {
                order_num: order_num.to_string(),
                org_name: org.to_string(),
                name: format!("customer-{}", order_num),
                address: String::new(),
                supervisor_name: "王五".to_string(),
                order_status: status.to_string(),
                create_time,
                last_updated: now,
            },
            now,
        )
    }

    #[tokio::test]
    async fn healthy_opportunity_creates_no_tasks() {
        let now = dt(2024, 1, 1, 10, 0);
        let f = fixture(now).await;
        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 9, 0), now);
        let created = f.manager.create_tasks(&[opp], "run-1").await.unwrap();
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn violation_creates_one_pending_task() {
        // Created Monday 10:00, now Tuesday 14:00 = 14 business hours.
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);

        let created = f.manager.create_tasks(&[opp], "run-1").await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].notification_type, "violation");
        assert_eq!(created[0].org_name, "Alpha");
        assert_eq!(created[0].created_run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn create_is_idempotent_under_a_frozen_clock() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);

        let first = f
            .manager
            .create_tasks(std::slice::from_ref(&opp), "run-1")
            .await
            .unwrap();
        let second = f
            .manager
            .create_tasks(std::slice::from_ref(&opp), "run-1")
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Pending)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn overdue_opportunity_gets_violation_and_standard_tasks() {
        // 30 business hours for pending appointment: violation and overdue.
        let now = dt(2024, 1, 4, 9, 0);
        let f = fixture(now).await;
        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 9, 0), now);
        assert!(opp.is_violation && opp.is_overdue);

        let created = f.manager.create_tasks(&[opp], "run-1").await.unwrap();
        let mut types: Vec<_> = created.iter().map(|t| t.notification_type.clone()).collect();
        types.sort();
        assert_eq!(types, vec!["standard", "violation"]);
    }

    #[tokio::test]
    async fn non_monitored_status_creates_nothing_regardless_of_age() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        let opp = opportunity("GD001", "Alpha", "已完成", dt(2023, 6, 1, 9, 0), now);
        let created = f.manager.create_tasks(&[opp], "run-1").await.unwrap();
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn escalations_aggregate_to_one_task_per_org() {
        // Both opportunities far past the 48h escalation threshold.
        let now = dt(2024, 1, 12, 18, 0);
        let f = fixture(now).await;
        let opps = vec![
            opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 9, 0), now),
            opportunity("GD002", "Alpha", "待预约", dt(2024, 1, 2, 9, 0), now),
        ];
        assert!(opps.iter().all(|o| o.escalation_level == 1));

        let created = f.manager.create_tasks(&opps, "run-1").await.unwrap();
        let escalations: Vec<_> = created
            .iter()
            .filter(|t| t.notification_type == "escalation")
            .collect();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].order_num, "ESCALATION_Alpha");

        // Second pass: the pending escalation task dedups the proposal.
        let again = f.manager.create_tasks(&opps, "run-2").await.unwrap();
        assert!(again
            .iter()
            .all(|t| t.notification_type != "escalation"));
    }

    #[tokio::test]
    async fn dispatch_batches_an_org_group_into_one_call() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let opps = vec![
            opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now),
            opportunity("GD002", "Alpha", "待预约", dt(2024, 1, 1, 9, 30), now),
        ];
        f.manager.create_tasks(&opps, "run-1").await.unwrap();

        let webhook = MockWebhook::sending();
        let summary = f
            .manager
            .execute_tasks("run-1", &opps, &webhook)
            .await
            .unwrap();

        assert_eq!(summary.sent_count, 2);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(webhook.call_count(), 1);
        let call = webhook.last_call().unwrap();
        assert_eq!(call.url, "http://chat.example/alpha");
        assert!(call.text.contains("GD001") && call.text.contains("GD002"));

        // The rendered text is persisted on the tasks.
        let sent = NotificationTaskRepository::list_recent(&f.pool, Some(TaskStatus::Sent), 10)
            .await
            .unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|t| t.message.as_deref() == Some(call.text.as_str())));
        assert!(sent.iter().all(|t| t.sent_run_id.as_deref() == Some("run-1")));
    }

    #[tokio::test]
    async fn cooldown_suppresses_a_second_send_within_the_window() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let make_opp = |at: NaiveDateTime| {
            opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), at)
        };

        let opp = make_opp(now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();
        let webhook = MockWebhook::sending();
        let summary = f
            .manager
            .execute_tasks("run-1", &[opp], &webhook)
            .await
            .unwrap();
        assert_eq!(summary.sent_count, 1);

        // One hour later (cooldown is 2h): no new task.
        f.clock.advance_hours(1.0);
        let opp = make_opp(f.clock.now());
        let created = f.manager.create_tasks(&[opp], "run-2").await.unwrap();
        assert!(created.is_empty());

        // Past the cooldown: a fresh task is allowed.
        f.clock.advance_hours(1.5);
        let opp = make_opp(f.clock.now());
        let created = f.manager.create_tasks(&[opp], "run-3").await.unwrap();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn group_cooldown_extends_the_task_cooldown() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        // 240 minutes = 4 hours, stricter than the 2h task default.
        GroupConfigRepository::upsert(
            &f.pool,
            UpsertGroupConfig {
                group_id: "g-alpha".to_string(),
                name: "Alpha".to_string(),
                webhook_url: "http://chat.example/alpha".to_string(),
                enabled: true,
                notification_cooldown_minutes: Some(240),
            },
            now,
        )
        .await
        .unwrap();

        let make_opp = |at: NaiveDateTime| {
            opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), at)
        };

        let opp = make_opp(now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();
        let webhook = MockWebhook::sending();
        f.manager
            .execute_tasks("run-1", &[opp], &webhook)
            .await
            .unwrap();

        // 3h later: inside the group window even though past the task one.
        f.clock.advance_hours(3.0);
        let created = f
            .manager
            .create_tasks(&[make_opp(f.clock.now())], "run-2")
            .await
            .unwrap();
        assert!(created.is_empty());

        f.clock.advance_hours(1.5);
        let created = f
            .manager
            .create_tasks(&[make_opp(f.clock.now())], "run-3")
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn missing_webhook_fails_the_group() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        // No group config for Alpha at all.
        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();

        let webhook = MockWebhook::sending();
        let summary = f
            .manager
            .execute_tasks("run-1", &[opp], &webhook)
            .await
            .unwrap();

        assert_eq!(summary.sent_count, 0);
        assert_eq!(summary.failed_count, 1);
        assert!(summary.errors.iter().any(|e| e.contains("NoWebhook")));
        assert_eq!(webhook.call_count(), 0);
    }

    #[tokio::test]
    async fn disabled_group_cancels_instead_of_sending() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", false).await;

        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();

        let webhook = MockWebhook::sending();
        let summary = f
            .manager
            .execute_tasks("run-1", &[opp], &webhook)
            .await
            .unwrap();

        assert_eq!(webhook.call_count(), 0);
        assert_eq!(summary.sent_count, 0);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Cancelled)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn escalation_goes_to_the_internal_ops_channel() {
        let now = dt(2024, 1, 12, 18, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;
        add_group(
            &f,
            INTERNAL_OPS_GROUP_ID,
            "Operations",
            "http://chat.example/ops",
            true,
        )
        .await;
        f.manager
            .settings
            .set(keys::ESCALATION_MENTION_USERS, "ops_lead,region_mgr")
            .await
            .unwrap();

        let opps = vec![
            opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 9, 0), now),
            opportunity("GD002", "Alpha", "待预约", dt(2024, 1, 2, 9, 0), now),
        ];
        f.manager.create_tasks(&opps, "run-1").await.unwrap();

        let webhook = MockWebhook::sending();
        let summary = f
            .manager
            .execute_tasks("run-1", &opps, &webhook)
            .await
            .unwrap();

        assert_eq!(summary.escalated_count, 1);
        let escalation_call = webhook
            .calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.url == "http://chat.example/ops")
            .cloned()
            .unwrap();
        assert!(escalation_call.text.contains("GD001"));
        assert!(escalation_call.text.contains("GD002"));
        assert!(escalation_call.text.contains("Escalation orders: 2"));
        assert_eq!(
            escalation_call.mentions,
            vec!["ops_lead".to_string(), "region_mgr".to_string()]
        );
    }

    #[tokio::test]
    async fn transient_failures_consume_the_retry_budget_then_fail() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();

        let webhook = MockWebhook::always(DispatchOutcome::Transient("503".to_string()));
        // Default retry budget is 5 attempts.
        for attempt in 1..=5 {
            let summary = f
                .manager
                .execute_tasks(&format!("run-{}", attempt), &[opp.clone()], &webhook)
                .await
                .unwrap();
            assert_eq!(summary.sent_count, 0);
            if attempt < 5 {
                assert_eq!(
                    NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Pending)
                        .await
                        .unwrap(),
                    1,
                    "attempt {} should leave the task pending",
                    attempt
                );
            }
        }

        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Failed)
                .await
                .unwrap(),
            1
        );
        assert_eq!(webhook.call_count(), 5);

        // A failed task never gets re-dispatched.
        let summary = f
            .manager
            .execute_tasks("run-6", &[opp], &webhook)
            .await
            .unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(webhook.call_count(), 5);
    }

    #[tokio::test]
    async fn permanent_failure_fails_immediately() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();

        let webhook = MockWebhook::always(DispatchOutcome::Permanent("404".to_string()));
        let summary = f
            .manager
            .execute_tasks("run-1", &[opp], &webhook)
            .await
            .unwrap();

        assert_eq!(summary.failed_count, 1);
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Failed)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn vanished_opportunity_cancels_its_task() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp], "run-1").await.unwrap();

        // Next run: the order is no longer in the report.
        let webhook = MockWebhook::sending();
        let summary = f.manager.execute_tasks("run-2", &[], &webhook).await.unwrap();

        assert_eq!(webhook.call_count(), 0);
        assert_eq!(summary.sent_count, 0);
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Cancelled)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cleanup_removes_old_finished_tasks_only() {
        let now = dt(2024, 1, 2, 14, 0);
        let f = fixture(now).await;
        add_group(&f, "g-alpha", "Alpha", "http://chat.example/alpha", true).await;

        let opp = opportunity("GD001", "Alpha", "待预约", dt(2024, 1, 1, 10, 0), now);
        f.manager.create_tasks(&[opp.clone()], "run-1").await.unwrap();
        let webhook = MockWebhook::sending();
        f.manager
            .execute_tasks("run-1", &[opp.clone()], &webhook)
            .await
            .unwrap();

        // A pending task created later must survive any cleanup.
        f.clock.advance_hours(3.0);
        let opp2 = opportunity("GD002", "Alpha", "待预约", dt(2024, 1, 1, 9, 0), f.clock.now());
        f.manager.create_tasks(&[opp2], "run-2").await.unwrap();

        // 40 days later, a 30-day cleanup removes the sent task.
        f.clock.advance_hours(40.0 * 24.0);
        let deleted = f.manager.cleanup_old_tasks(30).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            NotificationTaskRepository::count_by_status(&f.pool, TaskStatus::Pending)
                .await
                .unwrap(),
            1
        );
    }
}
