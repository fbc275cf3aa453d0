//! In-memory implementation of every repository trait.
//!
//! Used for tests and local dry runs; semantics mirror the PostgreSQL
//! repositories, including the (campaign, buyer) uniqueness of recipient rows.

use crate::models::*;
use crate::repository::{
    AdminUserRepository, AutomationRepository, BuyerRepository, CampaignRecipientRepository,
    CampaignRepository, EmailListRepository, InactiveBuyerQuery, JobRepository,
    PropertyRepository, TemplateRepository, TrackingRepository,
};
use acremail_common::types::{
    normalize_email, BuyerId, CampaignId, JobId, ListId, PropertyId, RuleId, TemplateId,
};
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    buyers: Vec<Buyer>,
    lists: Vec<EmailList>,
    list_members: Vec<(ListId, BuyerId)>,
    templates: Vec<EmailTemplate>,
    campaigns: Vec<Campaign>,
    recipients: Vec<CampaignRecipient>,
    tracking: Vec<EmailTrackingEvent>,
    rules: Vec<AutomationRule>,
    executions: Vec<AutomationExecution>,
    properties: Vec<Property>,
    admins: Vec<AdminUser>,
    jobs: Vec<Job>,
}

impl MemoryState {
    fn campaign_mut(&mut self, id: CampaignId) -> Option<&mut Campaign> {
        self.campaigns.iter_mut().find(|c| c.id == id)
    }

    fn recipient_mut(&mut self, campaign_id: CampaignId, buyer_id: BuyerId) -> Option<&mut CampaignRecipient> {
        self.recipients
            .iter_mut()
            .find(|r| r.campaign_id == campaign_id && r.buyer_id == buyer_id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_buyer(&self, buyer: Buyer) {
        self.state.write().await.buyers.push(buyer);
    }

    /// Insert a list together with its explicit members
    pub async fn insert_list(&self, list: EmailList, members: &[BuyerId]) {
        let mut state = self.state.write().await;
        state
            .list_members
            .extend(members.iter().map(|buyer_id| (list.id, *buyer_id)));
        state.lists.push(list);
    }

    pub async fn insert_template(&self, template: EmailTemplate) {
        self.state.write().await.templates.push(template);
    }

    pub async fn insert_campaign(&self, campaign: Campaign) {
        self.state.write().await.campaigns.push(campaign);
    }

    pub async fn insert_rule(&self, rule: AutomationRule) {
        self.state.write().await.rules.push(rule);
    }

    pub async fn insert_property(&self, property: Property) {
        self.state.write().await.properties.push(property);
    }

    pub async fn insert_admin(&self, admin: AdminUser) {
        self.state.write().await.admins.push(admin);
    }

    pub async fn insert_tracking_event(&self, event: EmailTrackingEvent) {
        self.state.write().await.tracking.push(event);
    }

    pub async fn insert_execution(&self, execution: AutomationExecution) {
        self.state.write().await.executions.push(execution);
    }

    pub async fn tracking_events(&self) -> Vec<EmailTrackingEvent> {
        self.state.read().await.tracking.clone()
    }

    pub async fn executions(&self) -> Vec<AutomationExecution> {
        self.state.read().await.executions.clone()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.read().await.jobs.clone()
    }
}

#[async_trait]
impl BuyerRepository for MemoryStore {
    async fn get(&self, id: BuyerId) -> Result<Option<Buyer>> {
        let state = self.state.read().await;
        Ok(state.buyers.iter().find(|b| b.id == id).cloned())
    }

    async fn get_many(&self, ids: &[BuyerId]) -> Result<Vec<Buyer>> {
        let state = self.state.read().await;
        Ok(state
            .buyers
            .iter()
            .filter(|b| ids.contains(&b.id))
            .cloned()
            .collect())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Buyer>> {
        let email = normalize_email(email);
        let state = self.state.read().await;
        Ok(state
            .buyers
            .iter()
            .find(|b| normalize_email(&b.email) == email)
            .cloned())
    }

    async fn find_matching(&self, criteria: &ListCriteria) -> Result<Vec<Buyer>> {
        let state = self.state.read().await;
        Ok(state
            .buyers
            .iter()
            .filter(|b| b.can_receive_email() && criteria.matches(b))
            .cloned()
            .collect())
    }

    async fn registered_since(&self, since: DateTime<Utc>) -> Result<Vec<Buyer>> {
        let state = self.state.read().await;
        Ok(state
            .buyers
            .iter()
            .filter(|b| b.created_at >= since && b.can_receive_email())
            .cloned()
            .collect())
    }

    async fn find_inactive(&self, query: &InactiveBuyerQuery) -> Result<Vec<Buyer>> {
        let state = self.state.read().await;
        let mut buyers: Vec<Buyer> = state
            .buyers
            .iter()
            .filter(|b| {
                b.can_receive_email()
                    && b.updated_at < query.inactive_since
                    && b.last_email_sent.map_or(true, |at| at < query.emailed_before)
            })
            .cloned()
            .collect();
        buyers.sort_by_key(|b| b.updated_at);
        if let Some(limit) = query.limit {
            buyers.truncate(limit.max(0) as usize);
        }
        Ok(buyers)
    }

    async fn unsubscribe(&self, id: BuyerId, at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for buyer in state.buyers.iter_mut().filter(|b| b.id == id) {
            buyer.email_opt_in = false;
            buyer.email_status = EmailStatus::Unsubscribed.to_string();
            buyer.updated_at = at;
            changed += 1;
        }
        Ok(changed)
    }

    async fn unsubscribe_by_email(&self, email: &str, at: DateTime<Utc>) -> Result<u64> {
        let email = normalize_email(email);
        let mut state = self.state.write().await;
        let mut changed = 0;
        for buyer in state
            .buyers
            .iter_mut()
            .filter(|b| normalize_email(&b.email) == email)
        {
            buyer.email_opt_in = false;
            buyer.email_status = EmailStatus::Unsubscribed.to_string();
            buyer.updated_at = at;
            changed += 1;
        }
        Ok(changed)
    }

    async fn stamp_last_email_sent(&self, ids: &[BuyerId], at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for buyer in state.buyers.iter_mut().filter(|b| ids.contains(&b.id)) {
            buyer.last_email_sent = Some(at);
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl EmailListRepository for MemoryStore {
    async fn get(&self, id: ListId) -> Result<Option<EmailList>> {
        let state = self.state.read().await;
        Ok(state.lists.iter().find(|l| l.id == id).cloned())
    }

    async fn members(&self, id: ListId) -> Result<Vec<Buyer>> {
        let state = self.state.read().await;
        Ok(state
            .list_members
            .iter()
            .filter(|(list_id, _)| *list_id == id)
            .filter_map(|(_, buyer_id)| state.buyers.iter().find(|b| b.id == *buyer_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>> {
        let state = self.state.read().await;
        Ok(state.templates.iter().find(|t| t.id == id).cloned())
    }

    async fn find_active_by_name(&self, fragment: &str) -> Result<Option<EmailTemplate>> {
        let fragment = fragment.to_lowercase();
        let state = self.state.read().await;
        Ok(state
            .templates
            .iter()
            .find(|t| t.is_active && t.name.to_lowercase().contains(&fragment))
            .cloned())
    }
}

#[async_trait]
impl CampaignRepository for MemoryStore {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        let state = self.state.read().await;
        Ok(state.campaigns.iter().find(|c| c.id == id).cloned())
    }

    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.campaign_mut(id).map(|campaign| {
            campaign.status = status.to_string();
            campaign.updated_at = Utc::now();
            campaign.clone()
        }))
    }

    async fn mark_queued(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.campaign_mut(id).map(|campaign| {
            campaign.status = CampaignStatus::Queued.to_string();
            campaign.sent_at = Some(at);
            campaign.error_message = None;
            campaign.updated_at = at;
            campaign.clone()
        }))
    }

    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        let mut state = self.state.write().await;
        Ok(state.campaign_mut(id).map(|campaign| {
            campaign.status = CampaignStatus::Scheduled.to_string();
            campaign.scheduled_at = Some(at);
            campaign.updated_at = Utc::now();
            campaign.clone()
        }))
    }

    async fn mark_failed(&self, id: CampaignId, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(campaign) = state.campaign_mut(id) {
            campaign.status = CampaignStatus::Failed.to_string();
            campaign.error_message = Some(error.to_string());
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, id: CampaignId, counts: RecipientCounts, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(campaign) = state.campaign_mut(id) {
            campaign.status = CampaignStatus::Completed.to_string();
            campaign.completed_at = Some(at);
            campaign.total_sent = counts.sent as i32;
            campaign.total_failed = counts.failed as i32;
            campaign.error_message = None;
            campaign.updated_at = at;
        }
        Ok(())
    }

    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let state = self.state.read().await;
        let mut due: Vec<Campaign> = state
            .campaigns
            .iter()
            .filter(|c| {
                c.status() == CampaignStatus::Scheduled && c.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        Ok(due)
    }

    async fn delete(&self, id: CampaignId) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.campaigns.len();
        state.campaigns.retain(|c| c.id != id);
        state.recipients.retain(|r| r.campaign_id != id);
        Ok(state.campaigns.len() < before)
    }
}

#[async_trait]
impl CampaignRecipientRepository for MemoryStore {
    async fn ensure_pending(
        &self,
        campaign_id: CampaignId,
        buyer_ids: &[BuyerId],
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut created = 0;
        for buyer_id in buyer_ids {
            if state.recipient_mut(campaign_id, *buyer_id).is_some() {
                continue;
            }
            state.recipients.push(CampaignRecipient {
                id: Uuid::now_v7(),
                campaign_id,
                buyer_id: *buyer_id,
                status: RecipientStatus::Pending.to_string(),
                error_message: None,
                sent_at: None,
                created_at: at,
                updated_at: at,
            });
            created += 1;
        }
        Ok(created)
    }

    async fn sent_buyer_ids(&self, campaign_id: CampaignId) -> Result<Vec<BuyerId>> {
        let state = self.state.read().await;
        let sent = RecipientStatus::Sent.to_string();
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.status == sent)
            .map(|r| r.buyer_id)
            .collect())
    }

    async fn mark_sent(&self, campaign_id: CampaignId, buyer_id: BuyerId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(row) = state.recipient_mut(campaign_id, buyer_id) {
            row.status = RecipientStatus::Sent.to_string();
            row.error_message = None;
            row.sent_at = Some(at);
            row.updated_at = at;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        campaign_id: CampaignId,
        buyer_id: BuyerId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(row) = state.recipient_mut(campaign_id, buyer_id) {
            row.status = RecipientStatus::Failed.to_string();
            row.error_message = Some(error.to_string());
            row.updated_at = at;
        }
        Ok(())
    }

    async fn list(&self, campaign_id: CampaignId) -> Result<Vec<CampaignRecipient>> {
        let state = self.state.read().await;
        Ok(state
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn counts(&self, campaign_id: CampaignId) -> Result<RecipientCounts> {
        let state = self.state.read().await;
        let mut counts = RecipientCounts::default();
        for row in state.recipients.iter().filter(|r| r.campaign_id == campaign_id) {
            match row.status.as_str() {
                "pending" => counts.pending += 1,
                "sent" => counts.sent += 1,
                "failed" => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl TrackingRepository for MemoryStore {
    async fn record(&self, event: NewTrackingEvent) -> Result<EmailTrackingEvent> {
        let row = EmailTrackingEvent {
            id: Uuid::now_v7(),
            campaign_id: event.campaign_id,
            buyer_id: event.buyer_id,
            event_type: event.event_type.to_string(),
            event_timestamp: event.event_timestamp,
            click_url: event.click_url,
            user_agent: event.user_agent,
            ip_address: event.ip_address,
            provider_event_id: event.provider_event_id,
            metadata: event.metadata,
        };
        self.state.write().await.tracking.push(row.clone());
        Ok(row)
    }

    async fn has_event_since(
        &self,
        campaign_id: Option<CampaignId>,
        buyer_id: BuyerId,
        event_type: TrackingEventType,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let event_type = event_type.to_string();
        let state = self.state.read().await;
        Ok(state.tracking.iter().any(|e| {
            e.campaign_id == campaign_id
                && e.buyer_id == buyer_id
                && e.event_type == event_type
                && e.event_timestamp >= since
        }))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.tracking.len();
        state.tracking.retain(|e| e.event_timestamp >= cutoff);
        Ok((before - state.tracking.len()) as u64)
    }

    async fn count_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<TrackingEventType, i64>> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for event in state
            .tracking
            .iter()
            .filter(|e| e.event_timestamp >= from && e.event_timestamp < to)
        {
            if let Ok(event_type) = event.event_type.parse::<TrackingEventType>() {
                *counts.entry(event_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailTrackingEvent>> {
        let state = self.state.read().await;
        Ok(state
            .tracking
            .iter()
            .filter(|e| e.campaign_id == Some(campaign_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AutomationRepository for MemoryStore {
    async fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>> {
        let state = self.state.read().await;
        Ok(state.rules.iter().find(|r| r.id == id).cloned())
    }

    async fn active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>> {
        let trigger = trigger.to_string();
        let state = self.state.read().await;
        Ok(state
            .rules
            .iter()
            .filter(|r| r.is_active && r.trigger_type == trigger)
            .cloned()
            .collect())
    }

    async fn record_execution(&self, input: NewAutomationExecution) -> Result<AutomationExecution> {
        let row = AutomationExecution {
            id: Uuid::now_v7(),
            rule_id: input.rule_id,
            triggered_by: input.triggered_by,
            recipient_count: input.recipient_count,
            status: input.status.to_string(),
            error_message: input.error_message,
            executed_at: input.executed_at,
        };
        self.state.write().await.executions.push(row.clone());
        Ok(row)
    }

    async fn executions_for_rule(&self, rule_id: RuleId) -> Result<Vec<AutomationExecution>> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect())
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let completed = ExecutionStatus::Completed.to_string();
        let mut state = self.state.write().await;
        let before = state.executions.len();
        state
            .executions
            .retain(|e| !(e.status == completed && e.executed_at < cutoff));
        Ok((before - state.executions.len()) as u64)
    }
}

#[async_trait]
impl PropertyRepository for MemoryStore {
    async fn get(&self, id: PropertyId) -> Result<Option<Property>> {
        let state = self.state.read().await;
        Ok(state.properties.iter().find(|p| p.id == id).cloned())
    }

    async fn auto_notify_since(&self, since: DateTime<Utc>) -> Result<Vec<Property>> {
        let state = self.state.read().await;
        Ok(state
            .properties
            .iter()
            .filter(|p| p.auto_notify_on_upload && p.created_at >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AdminUserRepository for MemoryStore {
    async fn active_admins(&self) -> Result<Vec<AdminUser>> {
        let state = self.state.read().await;
        Ok(state.admins.iter().filter(|a| a.is_active).cloned().collect())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        let row = Job {
            id: Uuid::now_v7(),
            queue: job.queue,
            payload: job.payload,
            status: JobStatus::Pending.to_string(),
            attempts: 0,
            max_attempts: job.max_attempts,
            progress: 0,
            last_error: None,
            result: None,
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: job.created_at,
        };
        self.state.write().await.jobs.push(row.clone());
        Ok(row)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let pending = JobStatus::Pending.to_string();
        let mut state = self.state.write().await;

        let mut due: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .iter()
            .filter(|j| j.status == pending && j.scheduled_at <= now)
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.job_mut(id) {
                job.status = JobStatus::Processing.to_string();
                job.started_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_stalled(&self, stale_before: DateTime<Utc>, error: &str) -> Result<u64> {
        let processing = JobStatus::Processing.to_string();
        let mut state = self.state.write().await;
        let mut released = 0;
        for job in state.jobs.iter_mut() {
            if job.status == processing && job.started_at.is_some_and(|at| at < stale_before) {
                job.status = JobStatus::Pending.to_string();
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.started_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn update_progress(&self, id: JobId, progress: i32) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.progress = progress;
        }
        Ok(())
    }

    async fn complete(&self, id: JobId, result: serde_json::Value, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.status = JobStatus::Completed.to_string();
            job.result = Some(result);
            job.progress = 100;
            job.completed_at = Some(at);
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.status = JobStatus::Failed.to_string();
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.completed_at = Some(at);
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, attempts: i32, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.job_mut(id) {
            job.status = JobStatus::Pending.to_string();
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.scheduled_at = run_at;
        }
        Ok(())
    }

    async fn trim_finished(&self, status: JobStatus, keep: i64) -> Result<u64> {
        let status = status.to_string();
        let mut state = self.state.write().await;

        let mut finished: Vec<(Option<DateTime<Utc>>, JobId)> = state
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| (j.completed_at, j.id))
            .collect();
        // newest first
        finished.sort_by(|a, b| b.cmp(a));

        let doomed: Vec<JobId> = finished
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|(_, id)| id)
            .collect();

        state.jobs.retain(|j| !doomed.contains(&j.id));
        Ok(doomed.len() as u64)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let completed = JobStatus::Completed.to_string();
        let failed = JobStatus::Failed.to_string();
        let mut state = self.state.write().await;
        let before = state.jobs.len();
        state.jobs.retain(|j| {
            let finished = j.status == completed || j.status == failed;
            !(finished && j.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.read().await;
        let mut stats = QueueStats::default();
        for job in &state.jobs {
            match job.status.as_str() {
                "pending" => stats.pending += 1,
                "processing" => stats.processing += 1,
                "completed" => stats.completed += 1,
                "failed" => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}
