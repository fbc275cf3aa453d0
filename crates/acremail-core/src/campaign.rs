//! Campaign lifecycle: send, schedule, pause, resume, delete and test sends

use crate::clock::{Clock, SystemClock};
use crate::delivery::{DeliveryEngine, SendOptions};
use crate::queue::JobQueue;
use acremail_common::types::CampaignId;
use acremail_storage::models::{Buyer, Campaign, CampaignStatus, EmailTemplate, TrackingEventType};
use acremail_storage::repository::{
    CampaignRepository, Repositories, TemplateRepository, TrackingRepository,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("Campaign not found: {0}")]
    NotFound(CampaignId),

    #[error("Template not found: {0}")]
    TemplateNotFound(uuid::Uuid),

    #[error("Campaign cannot move from {from} to {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Campaign cannot be deleted while sending")]
    DeleteWhileSending,

    #[error("Scheduled time must be in the future")]
    InvalidSchedule,

    #[error(transparent)]
    Storage(#[from] acremail_common::Error),

    #[error("Failed to queue campaign: {0}")]
    Queue(String),
}

impl CampaignError {
    pub fn status_code(&self) -> u16 {
        match self {
            CampaignError::NotFound(_) | CampaignError::TemplateNotFound(_) => 404,
            CampaignError::InvalidTransition { .. } | CampaignError::DeleteWhileSending => 409,
            CampaignError::InvalidSchedule => 400,
            CampaignError::Storage(e) => e.status_code(),
            CampaignError::Queue(_) => 500,
        }
    }
}

pub type CampaignResult<T> = std::result::Result<T, CampaignError>;

/// Event counts and rates. Rates are percentages of delivered mail with
/// two decimals; `sent` events stand in when nothing was delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailStats {
    pub total_sent: i64,
    pub opens: i64,
    pub clicks: i64,
    pub bounces: i64,
    pub unsubscribes: i64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
}

impl EmailStats {
    pub fn from_counts(counts: &HashMap<TrackingEventType, i64>) -> Self {
        let count = |kind: TrackingEventType| counts.get(&kind).copied().unwrap_or(0);

        let total_sent = match count(TrackingEventType::Delivered) {
            0 => count(TrackingEventType::Sent),
            delivered => delivered,
        };
        let opens = count(TrackingEventType::Opened);
        let clicks = count(TrackingEventType::Clicked);
        let bounces = count(TrackingEventType::Bounced);
        let unsubscribes = count(TrackingEventType::Unsubscribed);

        Self {
            total_sent,
            opens,
            clicks,
            bounces,
            unsubscribes,
            open_rate: rate(opens, total_sent),
            click_rate: rate(clicks, total_sent),
            bounce_rate: rate(bounces, total_sent),
            unsubscribe_rate: rate(unsubscribes, total_sent),
        }
    }
}

/// Percentage with two decimals; zero when there is no base
pub fn rate(count: i64, base: i64) -> f64 {
    if base <= 0 {
        return 0.0;
    }
    (count as f64 / base as f64 * 10000.0).round() / 100.0
}

pub struct CampaignManager {
    campaigns: Arc<dyn CampaignRepository>,
    templates: Arc<dyn TemplateRepository>,
    tracking: Arc<dyn TrackingRepository>,
    queue: JobQueue,
    delivery: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
}

impl CampaignManager {
    pub fn new(repos: &Repositories, queue: JobQueue, delivery: Arc<DeliveryEngine>) -> Self {
        Self {
            campaigns: repos.campaigns.clone(),
            templates: repos.templates.clone(),
            tracking: repos.tracking.clone(),
            queue,
            delivery,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn load(&self, id: CampaignId) -> CampaignResult<Campaign> {
        self.campaigns
            .get(id)
            .await?
            .ok_or(CampaignError::NotFound(id))
    }

    fn check_transition(campaign: &Campaign, to: CampaignStatus) -> CampaignResult<()> {
        let from = campaign.status();
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(CampaignError::InvalidTransition { from, to })
        }
    }

    /// Queue a draft or scheduled campaign for immediate sending
    pub async fn send_now(&self, id: CampaignId) -> CampaignResult<Campaign> {
        let campaign = self.load(id).await?;
        if !matches!(campaign.status(), CampaignStatus::Draft | CampaignStatus::Scheduled) {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status(),
                to: CampaignStatus::Queued,
            });
        }

        let queued = self
            .campaigns
            .mark_queued(id, self.clock.now())
            .await?
            .ok_or(CampaignError::NotFound(id))?;
        self.enqueue_or_fail(id).await?;
        Ok(queued)
    }

    /// Hand the campaign to the queue; a campaign that cannot be queued is
    /// marked failed rather than left in `queued`
    async fn enqueue_or_fail(&self, id: CampaignId) -> CampaignResult<()> {
        if let Err(e) = self.queue.enqueue_campaign(id).await {
            error!(campaign_id = %id, error = %e, "Failed to queue campaign");
            let message = e.to_string();
            self.campaigns.mark_failed(id, &message).await?;
            return Err(CampaignError::Queue(message));
        }
        Ok(())
    }

    pub async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> CampaignResult<Campaign> {
        if at <= self.clock.now() {
            return Err(CampaignError::InvalidSchedule);
        }

        let campaign = self.load(id).await?;
        Self::check_transition(&campaign, CampaignStatus::Scheduled)?;

        let scheduled = self
            .campaigns
            .schedule(id, at)
            .await?
            .ok_or(CampaignError::NotFound(id))?;
        info!(campaign_id = %id, scheduled_at = %at, "Campaign scheduled");
        Ok(scheduled)
    }

    /// Takes effect at the job's next pause check; a batch in flight finishes
    pub async fn pause(&self, id: CampaignId) -> CampaignResult<Campaign> {
        let campaign = self.load(id).await?;
        Self::check_transition(&campaign, CampaignStatus::Paused)?;

        let paused = self
            .campaigns
            .set_status(id, CampaignStatus::Paused)
            .await?
            .ok_or(CampaignError::NotFound(id))?;
        info!(campaign_id = %id, "Campaign paused");
        Ok(paused)
    }

    /// Re-queue a paused campaign. Recipients already sent are skipped.
    pub async fn resume(&self, id: CampaignId) -> CampaignResult<Campaign> {
        let campaign = self.load(id).await?;
        Self::check_transition(&campaign, CampaignStatus::Queued)?;
        if campaign.status() != CampaignStatus::Paused {
            return Err(CampaignError::InvalidTransition {
                from: campaign.status(),
                to: CampaignStatus::Queued,
            });
        }

        let resumed = self
            .campaigns
            .set_status(id, CampaignStatus::Queued)
            .await?
            .ok_or(CampaignError::NotFound(id))?;
        self.enqueue_or_fail(id).await?;
        info!(campaign_id = %id, "Campaign resumed");
        Ok(resumed)
    }

    pub async fn delete(&self, id: CampaignId) -> CampaignResult<()> {
        let campaign = self.load(id).await?;
        if campaign.status() == CampaignStatus::Sending {
            return Err(CampaignError::DeleteWhileSending);
        }

        self.campaigns.delete(id).await?;
        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Send the campaign's content to one address, untracked
    pub async fn send_test(&self, id: CampaignId, test_email: &str) -> CampaignResult<bool> {
        let campaign = self.load(id).await?;
        let template = self.template_for(&campaign).await?;

        let now = self.clock.now();
        let recipient = Buyer {
            id: uuid::Uuid::new_v4(),
            email: test_email.to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            buyer_type: None,
            preferred_areas: Vec::new(),
            source: None,
            email_opt_in: true,
            email_status: "active".to_string(),
            last_email_sent: None,
            created_at: now,
            updated_at: now,
        };
        let options = SendOptions {
            from_name: campaign.from_name.clone(),
            from_email: campaign.from_email.clone(),
            reply_to: campaign.reply_to.clone(),
            ..Default::default()
        };
        let subject = if campaign.subject.trim().is_empty() {
            &template.subject
        } else {
            &campaign.subject
        };

        Ok(self
            .delivery
            .send_single_email(&recipient, &template, subject, &options, None)
            .await)
    }

    async fn template_for(&self, campaign: &Campaign) -> CampaignResult<EmailTemplate> {
        self.templates
            .get(campaign.template_id)
            .await?
            .ok_or(CampaignError::TemplateNotFound(campaign.template_id))
    }

    /// Counts from the campaign's tracking log
    pub async fn analytics(&self, id: CampaignId) -> CampaignResult<EmailStats> {
        self.load(id).await?;
        let events = self.tracking.list_for_campaign(id).await?;

        let mut counts: HashMap<TrackingEventType, i64> = HashMap::new();
        for event in &events {
            if let Ok(kind) = event.event_type.parse::<TrackingEventType>() {
                *counts.entry(kind).or_default() += 1;
            }
        }
        Ok(EmailStats::from_counts(&counts))
    }
}
