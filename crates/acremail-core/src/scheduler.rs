//! Recurring tasks on cron schedules
//!
//! Each task is a public method that reads "now" from the injected clock, so
//! it can be driven directly. `start` registers them with a cron scheduler;
//! ticks run independently and a failing tick only logs.

use crate::automation::{AutomationEngine, TriggerConditions, TriggerData};
use crate::campaign::EmailStats;
use crate::clock::{Clock, SystemClock};
use crate::queue::JobQueue;
use acremail_common::config::SchedulerConfig;
use acremail_common::types::{BuyerId, TemplateId};
use acremail_storage::models::TriggerType;
use acremail_storage::repository::{
    AdminUserRepository, AutomationRepository, BuyerRepository, CampaignRepository,
    InactiveBuyerQuery, PropertyRepository, Repositories, TemplateRepository, TrackingRepository,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Months, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

/// Name fragment of the template used for re-engagement
pub const REENGAGEMENT_TEMPLATE: &str = "Re-engagement";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    ScheduledCampaigns,
    AutomationTriggers,
    Cleanup,
    DailySummary,
    Reengagement,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::ScheduledCampaigns => "scheduled-campaigns",
            Task::AutomationTriggers => "automation-triggers",
            Task::Cleanup => "cleanup",
            Task::DailySummary => "daily-summary",
            Task::Reengagement => "reengagement",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerSummary {
    pub new_buyers: usize,
    pub new_properties: usize,
    pub inactive_buyers: usize,
    pub executions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub tracking_events: u64,
    pub executions: u64,
}

/// One admin's copy of the prior day's numbers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub recipient: String,
    pub recipient_name: Option<String>,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: EmailStats,
}

/// Buyers eligible for the re-engagement template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReengagementBatch {
    pub template_id: TemplateId,
    pub buyer_ids: Vec<BuyerId>,
}

pub struct Scheduler {
    campaigns: Arc<dyn CampaignRepository>,
    buyers: Arc<dyn BuyerRepository>,
    properties: Arc<dyn PropertyRepository>,
    templates: Arc<dyn TemplateRepository>,
    tracking: Arc<dyn TrackingRepository>,
    rules: Arc<dyn AutomationRepository>,
    admins: Arc<dyn AdminUserRepository>,
    queue: JobQueue,
    automation: Arc<AutomationEngine>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        repos: &Repositories,
        queue: JobQueue,
        automation: Arc<AutomationEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            campaigns: repos.campaigns.clone(),
            buyers: repos.buyers.clone(),
            properties: repos.properties.clone(),
            templates: repos.templates.clone(),
            tracking: repos.tracking.clone(),
            rules: repos.automation.clone(),
            admins: repos.admins.clone(),
            queue,
            automation,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue every scheduled campaign that is due. A campaign that cannot
    /// be queued is marked failed and the rest still go out.
    pub async fn process_scheduled_campaigns(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.campaigns.scheduled_due(now).await?;
        let mut queued = 0;

        for campaign in &due {
            info!(campaign_id = %campaign.id, campaign = %campaign.name, "Processing scheduled campaign");

            let result = async {
                self.campaigns.mark_queued(campaign.id, now).await?;
                self.queue.enqueue_campaign(campaign.id).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;

            match result {
                Ok(()) => queued += 1,
                Err(e) => {
                    error!(campaign_id = %campaign.id, error = %e, "Error queuing scheduled campaign");
                    if let Err(mark_err) = self.campaigns.mark_failed(campaign.id, &e.to_string()).await {
                        error!(campaign_id = %campaign.id, error = %mark_err, "Failed to mark campaign failed");
                    }
                }
            }
        }

        if !due.is_empty() {
            info!(due = due.len(), queued, "Processed scheduled campaigns");
        }
        Ok(queued)
    }

    /// New buyers, new auto-notify properties and inactive buyers
    pub async fn process_automation_triggers(&self) -> Result<TriggerSummary> {
        let mut summary = TriggerSummary::default();
        let since = self.clock.now() - chrono::Duration::minutes(self.config.trigger_window_minutes);

        let new_buyers = self.buyers.registered_since(since).await?;
        summary.new_buyers = new_buyers.len();
        for buyer in &new_buyers {
            let data = TriggerData::buyer(TriggerType::BuyerRegistered, buyer.id);
            summary.executions += self.fire(TriggerType::BuyerRegistered, &data).await;
        }
        if !new_buyers.is_empty() {
            info!(count = new_buyers.len(), "Processed new buyer registrations");
        }

        let new_properties = self.properties.auto_notify_since(since).await?;
        summary.new_properties = new_properties.len();
        for property in &new_properties {
            let data = TriggerData::property(TriggerType::PropertyUploaded, property);
            summary.executions += self.fire(TriggerType::PropertyUploaded, &data).await;
        }
        if !new_properties.is_empty() {
            info!(count = new_properties.len(), "Processed new property uploads");
        }

        let now = self.clock.now();
        let mut reached: Vec<BuyerId> = Vec::new();
        for rule in self.rules.active_rules(TriggerType::BuyerInactive).await? {
            let days = TriggerConditions::from_rule(&rule)
                .inactive_days
                .unwrap_or(self.config.inactivity_days);
            let query = InactiveBuyerQuery {
                inactive_since: now - chrono::Duration::days(days),
                emailed_before: now - chrono::Duration::days(self.config.email_cooldown_days),
                limit: None,
            };

            let inactive = match self.buyers.find_inactive(&query).await {
                Ok(buyers) => buyers,
                Err(e) => {
                    error!(rule_id = %rule.id, error = %e, "Error processing inactivity rule");
                    continue;
                }
            };

            for buyer in &inactive {
                let data = TriggerData {
                    inactive_days: Some(days),
                    ..TriggerData::buyer(TriggerType::BuyerInactive, buyer.id)
                };
                match self.automation.execute_rule(&rule, &data).await {
                    Ok(execution) => {
                        summary.executions += 1;
                        if execution.recipient_count > 0 {
                            reached.push(buyer.id);
                        }
                    }
                    Err(e) => error!(rule_id = %rule.id, error = %e, "Error executing automation rule"),
                }
            }
            summary.inactive_buyers += inactive.len();
            info!(rule = %rule.name, count = inactive.len(), "Processed inactive buyers");
        }

        // Start the cooldown as soon as the send is queued; a delayed job
        // would otherwise leave the buyer selectable on every tick
        if !reached.is_empty() {
            reached.sort();
            reached.dedup();
            if let Err(e) = self.buyers.stamp_last_email_sent(&reached, now).await {
                warn!(error = %e, "Failed to stamp inactive buyers");
            }
        }

        Ok(summary)
    }

    async fn fire(&self, trigger: TriggerType, data: &TriggerData) -> usize {
        match self.automation.fire(trigger, data).await {
            Ok(executions) => executions.len(),
            Err(e) => {
                error!(trigger = %trigger, error = %e, "Error firing automation rules");
                0
            }
        }
    }

    /// Drop old tracking events and old completed executions
    pub async fn cleanup_old_tracking_data(&self) -> Result<CleanupSummary> {
        let now = self.clock.now();
        let tracking_cutoff = months_before(now, self.config.tracking_retention_months)?;
        let execution_cutoff = months_before(now, self.config.execution_retention_months)?;

        let summary = CleanupSummary {
            tracking_events: self.tracking.purge_before(tracking_cutoff).await?,
            executions: self.rules.purge_completed_before(execution_cutoff).await?,
        };

        info!(
            tracking_events = summary.tracking_events,
            executions = summary.executions,
            "Cleanup completed"
        );
        Ok(summary)
    }

    /// Yesterday's numbers for each active admin. Empty when nothing was sent.
    pub async fn send_daily_summary(&self) -> Result<Vec<AnalyticsSummary>> {
        let admins = self.admins.active_admins().await?;
        if admins.is_empty() {
            return Ok(Vec::new());
        }

        let today = self.clock.now().date_naive();
        let yesterday = today
            .pred_opt()
            .ok_or_else(|| anyhow!("no day before {}", today))?;
        let from = yesterday.and_time(NaiveTime::MIN).and_utc();
        let to = today.and_time(NaiveTime::MIN).and_utc();

        let counts = self.tracking.count_by_type(from, to).await?;
        let stats = EmailStats::from_counts(&counts);
        if stats.total_sent == 0 {
            debug!(date = %yesterday, "No emails sent, skipping daily summary");
            return Ok(Vec::new());
        }

        let summaries: Vec<AnalyticsSummary> = admins
            .into_iter()
            .map(|admin| {
                let name = [admin.first_name, admin.last_name]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                AnalyticsSummary {
                    recipient: admin.email,
                    recipient_name: Some(name).filter(|n| !n.is_empty()),
                    date: yesterday,
                    stats: stats.clone(),
                }
            })
            .collect();

        for summary in &summaries {
            info!(
                recipient = %summary.recipient,
                date = %summary.date,
                total_sent = summary.stats.total_sent,
                "Daily analytics summary ready"
            );
        }
        Ok(summaries)
    }

    /// Pick quiet buyers for re-engagement and stamp them so the next run
    /// does not pick them again
    pub async fn process_reengagement(&self) -> Result<Option<ReengagementBatch>> {
        let now = self.clock.now();
        let query = InactiveBuyerQuery {
            inactive_since: now - chrono::Duration::days(self.config.inactivity_days),
            emailed_before: now - chrono::Duration::days(self.config.email_cooldown_days),
            limit: Some(self.config.reengagement_limit),
        };

        let buyers = self.buyers.find_inactive(&query).await?;
        if buyers.is_empty() {
            return Ok(None);
        }

        let Some(template) = self.templates.find_active_by_name(REENGAGEMENT_TEMPLATE).await? else {
            warn!("No re-engagement template found");
            return Ok(None);
        };

        let buyer_ids: Vec<BuyerId> = buyers.iter().map(|b| b.id).collect();
        self.buyers.stamp_last_email_sent(&buyer_ids, now).await?;

        info!(
            template_id = %template.id,
            count = buyer_ids.len(),
            "Re-engagement batch selected"
        );
        Ok(Some(ReengagementBatch {
            template_id: template.id,
            buyer_ids,
        }))
    }

    async fn run_task(&self, task: Task) -> Result<()> {
        match task {
            Task::ScheduledCampaigns => self.process_scheduled_campaigns().await.map(|_| ()),
            Task::AutomationTriggers => self.process_automation_triggers().await.map(|_| ()),
            Task::Cleanup => self.cleanup_old_tracking_data().await.map(|_| ()),
            Task::DailySummary => self.send_daily_summary().await.map(|_| ()),
            Task::Reengagement => self.process_reengagement().await.map(|_| ()),
        }
    }

    /// Register every task and start ticking
    pub async fn start(self: Arc<Self>) -> Result<SchedulerHandle> {
        let sched = JobScheduler::new().await?;

        let tasks = [
            (Task::ScheduledCampaigns, self.config.scheduled_campaigns_cron.clone()),
            (Task::AutomationTriggers, self.config.automation_triggers_cron.clone()),
            (Task::Cleanup, self.config.cleanup_cron.clone()),
            (Task::DailySummary, self.config.daily_summary_cron.clone()),
            (Task::Reengagement, self.config.reengagement_cron.clone()),
        ];

        for (task, cron) in tasks {
            let scheduler = self.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    debug!(task = task.name(), "Running scheduled task");
                    if let Err(e) = scheduler.run_task(task).await {
                        error!(task = task.name(), error = %e, "Scheduled task failed");
                    }
                })
            })?;
            sched.add(job).await?;
            info!(task = task.name(), cron = %cron, "Registered scheduled task");
        }

        sched.start().await?;
        info!("Email scheduler started");
        Ok(SchedulerHandle { inner: sched })
    }
}

fn months_before(now: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    now.checked_sub_months(Months::new(months))
        .ok_or_else(|| anyhow!("cannot go back {} months from {}", months, now))
}

/// Running cron scheduler
pub struct SchedulerHandle {
    inner: JobScheduler,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await?;
        info!("Email scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{admin, buyer, campaign, list, property, rule, template, tracking_event, Harness};
    use acremail_storage::models::CampaignStatus;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_due_campaigns_are_queued() {
        let h = Harness::new().await;
        let mut due = campaign(uuid::Uuid::new_v4(), vec![], CampaignStatus::Scheduled);
        due.scheduled_at = Some(h.clock.now() - chrono::Duration::seconds(30));
        let mut later = campaign(uuid::Uuid::new_v4(), vec![], CampaignStatus::Scheduled);
        later.scheduled_at = Some(h.clock.now() + chrono::Duration::hours(1));
        h.store.insert_campaign(due.clone()).await;
        h.store.insert_campaign(later.clone()).await;

        assert_eq!(h.scheduler().process_scheduled_campaigns().await.unwrap(), 1);

        let stored = CampaignRepository::get(h.store.as_ref(), due.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "queued");
        let stored = CampaignRepository::get(h.store.as_ref(), later.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "scheduled");
        assert_eq!(h.store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_new_buyer_fires_registration_rules() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        h.store.insert_rule(rule(TriggerType::BuyerRegistered, tpl.id, vec![])).await;

        let mut fresh = buyer("new@x.com");
        fresh.created_at = h.clock.now() - chrono::Duration::minutes(2);
        let mut old = buyer("old@x.com");
        old.created_at = h.clock.now() - chrono::Duration::days(2);
        h.store.insert_buyer(fresh.clone()).await;
        h.store.insert_buyer(old).await;

        let summary = h.scheduler().process_automation_triggers().await.unwrap();
        assert_eq!(summary.new_buyers, 1);
        assert_eq!(summary.executions, 1);

        let executions = h.store.executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].recipient_count, 1);
        assert_eq!(executions[0].status, "queued");
    }

    #[tokio::test]
    async fn test_property_upload_fires_rules() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let a = buyer("a@x.com");
        h.store.insert_buyer(a.clone()).await;
        let l = list(None);
        h.store.insert_list(l.clone(), &[a.id]).await;
        h.store.insert_rule(rule(TriggerType::PropertyUploaded, tpl.id, vec![l.id])).await;

        let mut p = property(40000.0);
        p.auto_notify_on_upload = true;
        p.created_at = h.clock.now() - chrono::Duration::minutes(1);
        h.store.insert_property(p).await;

        let summary = h.scheduler().process_automation_triggers().await.unwrap();
        assert_eq!(summary.new_properties, 1);
        assert_eq!(h.store.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_inactivity_rule_selects_quiet_buyers() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let mut r = rule(TriggerType::BuyerInactive, tpl.id, vec![]);
        r.trigger_conditions = serde_json::json!({ "inactiveDays": 10 });
        h.store.insert_rule(r).await;

        let now = h.clock.now();
        let mut quiet = buyer("quiet@x.com");
        quiet.created_at = now - chrono::Duration::days(60);
        quiet.updated_at = now - chrono::Duration::days(20);
        let mut recently_emailed = quiet.clone();
        recently_emailed.id = uuid::Uuid::new_v4();
        recently_emailed.email = "mailed@x.com".into();
        recently_emailed.last_email_sent = Some(now - chrono::Duration::days(2));
        let mut active = buyer("active@x.com");
        active.created_at = now - chrono::Duration::days(60);
        active.updated_at = now - chrono::Duration::days(1);
        for b in [&quiet, &recently_emailed, &active] {
            h.store.insert_buyer(b.clone()).await;
        }

        let summary = h.scheduler().process_automation_triggers().await.unwrap();
        assert_eq!(summary.inactive_buyers, 1);

        let executions = h.store.executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].triggered_by["buyerId"], quiet.id.to_string());
        assert_eq!(executions[0].triggered_by["inactiveDays"], 10);
    }

    #[tokio::test]
    async fn test_delayed_inactivity_rule_queues_once() {
        let h = Harness::new().await;
        let tpl = template();
        h.store.insert_template(tpl.clone()).await;
        let mut r = rule(TriggerType::BuyerInactive, tpl.id, vec![]);
        r.delay = 1;
        r.delay_unit = "days".into();
        h.store.insert_rule(r).await;

        let now = h.clock.now();
        let mut quiet = buyer("quiet@x.com");
        quiet.created_at = now - chrono::Duration::days(90);
        quiet.updated_at = now - chrono::Duration::days(45);
        h.store.insert_buyer(quiet.clone()).await;

        let scheduler = h.scheduler();
        let first = scheduler.process_automation_triggers().await.unwrap();
        assert_eq!(first.inactive_buyers, 1);

        h.clock.advance(chrono::Duration::minutes(5));
        let second = scheduler.process_automation_triggers().await.unwrap();
        assert_eq!(second.inactive_buyers, 0);

        let jobs = h.store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scheduled_at, now + chrono::Duration::days(1));
        assert_eq!(h.store.executions().await.len(), 1);
        // nothing went out yet
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let h = Harness::new().await;
        h.clock.set(Utc.with_ymd_and_hms(2026, 7, 15, 2, 0, 0).unwrap());
        let now = h.clock.now();

        let kept = now - Months::new(5) - chrono::Duration::days(29);
        let dropped = now - Months::new(6) - chrono::Duration::days(1);
        h.store.insert_tracking_event(tracking_event(None, "opened", kept)).await;
        h.store.insert_tracking_event(tracking_event(None, "opened", dropped)).await;

        let summary = h.scheduler().cleanup_old_tracking_data().await.unwrap();
        assert_eq!(summary.tracking_events, 1);

        let remaining = h.store.tracking_events().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_timestamp, kept);
    }

    #[tokio::test]
    async fn test_daily_summary() {
        let h = Harness::new().await;
        h.clock.set(Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
        h.store.insert_admin(admin("ops@landivo.com")).await;
        let scheduler = h.scheduler();

        // nothing sent yesterday
        assert!(scheduler.send_daily_summary().await.unwrap().is_empty());

        let yesterday = Utc.with_ymd_and_hms(2026, 3, 9, 15, 0, 0).unwrap();
        for kind in ["delivered", "delivered", "opened"] {
            h.store.insert_tracking_event(tracking_event(None, kind, yesterday)).await;
        }
        // today's events do not count
        h.store.insert_tracking_event(tracking_event(None, "delivered", h.clock.now())).await;

        let summaries = scheduler.send_daily_summary().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].recipient, "ops@landivo.com");
        assert_eq!(summaries[0].date, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(summaries[0].stats.total_sent, 2);
        assert_eq!(summaries[0].stats.open_rate, 50.0);
    }

    #[tokio::test]
    async fn test_reengagement_stamps_selection() {
        let h = Harness::new().await;
        let now = h.clock.now();
        let mut quiet = buyer("quiet@x.com");
        quiet.updated_at = now - chrono::Duration::days(45);
        h.store.insert_buyer(quiet.clone()).await;
        let scheduler = h.scheduler();

        // no template yet
        assert_eq!(scheduler.process_reengagement().await.unwrap(), None);

        let mut tpl = template();
        tpl.name = "Buyer Re-engagement".into();
        h.store.insert_template(tpl.clone()).await;

        let batch = scheduler.process_reengagement().await.unwrap().unwrap();
        assert_eq!(batch.template_id, tpl.id);
        assert_eq!(batch.buyer_ids, vec![quiet.id]);

        // stamped buyers are not picked again
        assert_eq!(scheduler.process_reengagement().await.unwrap(), None);
    }
}
