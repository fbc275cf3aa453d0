//! Job payloads and the email job executor

use super::manager::{JobContext, JobExecutor};
use crate::audience::AudienceResolver;
use crate::clock::{Clock, SystemClock};
use crate::delivery::{BulkSendResult, DeliveryEngine, SendOptions};
use acremail_common::types::{BuyerId, CampaignId, TemplateId};
use acremail_common::Error;
use acremail_storage::models::{Campaign, CampaignStatus, RecipientCounts};
use acremail_storage::repository::{
    BuyerRepository, CampaignRecipientRepository, CampaignRepository, Repositories,
    TemplateRepository,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const SEND_CAMPAIGN: &str = "send-campaign";
pub const SEND_BULK_EMAILS: &str = "send-bulk-emails";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobKind {
    SendCampaign(CampaignJob),
    SendBulkEmails(BulkEmailJob),
}

impl JobKind {
    /// Queue name stored with the job
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::SendCampaign(_) => SEND_CAMPAIGN,
            JobKind::SendBulkEmails(_) => SEND_BULK_EMAILS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignJob {
    pub campaign_id: CampaignId,
}

/// One pre-sliced batch. Buyers are reloaded when the job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEmailJob {
    pub buyer_ids: Vec<BuyerId>,
    pub template_id: TemplateId,
    #[serde(default)]
    pub options: BulkEmailOptions,
    pub batch_number: usize,
    pub total_batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEmailOptions {
    /// Overrides the template subject
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub send: SendOptions,
}

/// Executes `send-campaign` and `send-bulk-emails` jobs
pub struct EmailJobExecutor {
    campaigns: Arc<dyn CampaignRepository>,
    templates: Arc<dyn TemplateRepository>,
    recipients: Arc<dyn CampaignRecipientRepository>,
    buyers: Arc<dyn BuyerRepository>,
    audience: AudienceResolver,
    delivery: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_delay: Duration,
}

impl EmailJobExecutor {
    pub fn new(repos: &Repositories, delivery: Arc<DeliveryEngine>) -> Self {
        Self {
            campaigns: repos.campaigns.clone(),
            templates: repos.templates.clone(),
            recipients: repos.recipients.clone(),
            buyers: repos.buyers.clone(),
            audience: AudienceResolver::new(repos.lists.clone(), repos.buyers.clone()),
            delivery,
            clock: Arc::new(SystemClock),
            batch_size: 50,
            batch_delay: Duration::from_secs(2),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, batch_delay: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.batch_delay = batch_delay;
        self
    }

    async fn send_campaign(&self, campaign_id: CampaignId, ctx: &JobContext) -> Result<Value> {
        match self.run_campaign(campaign_id, ctx).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(campaign_id = %campaign_id, error = %message, "Campaign send failed");
                if let Err(mark_err) = self.campaigns.mark_failed(campaign_id, &message).await {
                    error!(campaign_id = %campaign_id, error = %mark_err, "Failed to mark campaign failed");
                }
                Err(e)
            }
        }
    }

    async fn load_campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        Ok(self
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::not_found("campaign", campaign_id))?)
    }

    async fn is_paused(&self, campaign_id: CampaignId) -> Result<bool> {
        Ok(self.load_campaign(campaign_id).await?.status() == CampaignStatus::Paused)
    }

    async fn run_campaign(&self, campaign_id: CampaignId, ctx: &JobContext) -> Result<Value> {
        let campaign = self.load_campaign(campaign_id).await?;

        match campaign.status() {
            CampaignStatus::Paused => {
                info!(campaign_id = %campaign_id, "Campaign is paused, skipping");
                return Ok(json!({ "status": "paused" }));
            }
            CampaignStatus::Completed => {
                warn!(campaign_id = %campaign_id, "Campaign already completed, skipping");
                return Ok(json!({ "status": "completed" }));
            }
            _ => {}
        }

        let template = self
            .templates
            .get(campaign.template_id)
            .await?
            .ok_or_else(|| Error::not_found("template", campaign.template_id))?;

        self.campaigns
            .set_status(campaign_id, CampaignStatus::Sending)
            .await?;

        let audience = self.audience.resolve(&campaign.target_lists).await?;
        if audience.is_empty() {
            info!(campaign_id = %campaign_id, "Campaign has no recipients");
            self.campaigns
                .complete(campaign_id, RecipientCounts::default(), self.clock.now())
                .await?;
            ctx.report_progress(100).await;
            return Ok(json!({ "status": "completed", "recipients": 0 }));
        }

        let ids: Vec<BuyerId> = audience.iter().map(|b| b.id).collect();
        self.recipients
            .ensure_pending(campaign_id, &ids, self.clock.now())
            .await?;

        // rows already sent by an earlier attempt are not sent again
        let already_sent: HashSet<BuyerId> = self
            .recipients
            .sent_buyer_ids(campaign_id)
            .await?
            .into_iter()
            .collect();
        let pending: Vec<_> = audience
            .into_iter()
            .filter(|b| !already_sent.contains(&b.id))
            .collect();

        let subject = if campaign.subject.trim().is_empty() {
            template.subject.clone()
        } else {
            campaign.subject.clone()
        };
        let options = SendOptions {
            from_name: campaign.from_name.clone(),
            from_email: campaign.from_email.clone(),
            reply_to: campaign.reply_to.clone(),
            ..Default::default()
        };

        let total = pending.len();
        for (index, batch) in pending.chunks(self.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
                if self.is_paused(campaign_id).await? {
                    info!(campaign_id = %campaign_id, "Campaign paused between batches");
                    return Ok(json!({ "status": "paused" }));
                }
            }

            let start = index * self.batch_size;
            ctx.report_progress((start * 100 / total) as i32).await;

            let result = self
                .delivery
                .send_bulk_emails(batch, &template, &subject, &options, Some(campaign_id))
                .await;
            self.record_outcomes(campaign_id, &result).await?;
        }

        let counts = self.recipients.counts(campaign_id).await?;
        self.campaigns
            .complete(campaign_id, counts, self.clock.now())
            .await?;
        ctx.report_progress(100).await;

        info!(
            campaign_id = %campaign_id,
            sent = counts.sent,
            failed = counts.failed,
            "Campaign completed"
        );

        Ok(json!({
            "status": "completed",
            "totalSent": counts.sent,
            "totalFailed": counts.failed,
            "recipients": counts.sent + counts.failed + counts.pending,
        }))
    }

    async fn record_outcomes(&self, campaign_id: CampaignId, result: &BulkSendResult) -> Result<()> {
        let now = self.clock.now();
        for sent in &result.sent {
            self.recipients.mark_sent(campaign_id, sent.buyer_id, now).await?;
        }
        for failed in &result.failed {
            self.recipients
                .mark_failed(campaign_id, failed.buyer_id, &failed.error, now)
                .await?;
        }
        self.stamp_sent(result).await;
        Ok(())
    }

    async fn stamp_sent(&self, result: &BulkSendResult) {
        if result.sent.is_empty() {
            return;
        }
        let ids: Vec<BuyerId> = result.sent.iter().map(|s| s.buyer_id).collect();
        if let Err(e) = self.buyers.stamp_last_email_sent(&ids, self.clock.now()).await {
            warn!(error = %e, "Failed to stamp last email sent");
        }
    }

    async fn send_bulk(&self, job: &BulkEmailJob) -> Result<Value> {
        info!(
            "Processing email batch {}/{} with {} recipients",
            job.batch_number,
            job.total_batches,
            job.buyer_ids.len()
        );

        let template = self
            .templates
            .get(job.template_id)
            .await?
            .ok_or_else(|| Error::not_found("template", job.template_id))?;

        let buyers = self.audience.load_buyers(&job.buyer_ids).await?;
        let skipped = job.buyer_ids.len() - buyers.len();
        if skipped > 0 {
            info!(skipped, "Skipping buyers that are gone or no longer consent");
        }

        let subject = job
            .options
            .subject
            .clone()
            .unwrap_or_else(|| template.subject.clone());

        let result = self
            .delivery
            .send_bulk_emails(&buyers, &template, &subject, &job.options.send, None)
            .await;
        self.stamp_sent(&result).await;

        Ok(serde_json::to_value(&result)?)
    }
}

#[async_trait]
impl JobExecutor for EmailJobExecutor {
    async fn execute(&self, job: &JobKind, ctx: &JobContext) -> Result<Value> {
        match job {
            JobKind::SendCampaign(job) => self.send_campaign(job.campaign_id, ctx).await,
            JobKind::SendBulkEmails(job) => self.send_bulk(job).await,
        }
    }

    async fn abandon(&self, job: &JobKind, error: &str) {
        if let JobKind::SendCampaign(job) = job {
            warn!(campaign_id = %job.campaign_id, "Giving up on campaign job");
            if let Err(e) = self.campaigns.mark_failed(job.campaign_id, error).await {
                error!(campaign_id = %job.campaign_id, error = %e, "Failed to mark campaign failed");
            }
        }
    }
}
