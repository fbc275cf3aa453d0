//! Delivery Engine - renders and sends one message per recipient
//!
//! Recipients are processed sequentially with a fixed pacing delay. One
//! failed recipient never aborts the batch.

use crate::clock::{Clock, SystemClock};
use crate::metrics::Metrics;
use crate::template::{RenderContext, RenderError, TemplateRenderer};
use crate::tokens::{encode_tracking_token, TrackingUrls, UnsubscribeSigner};
use crate::transport::{
    EmailTransport, OutboundEmail, ProviderReceipt, TransportError, EMAIL_TYPE_CAMPAIGN,
    MANUAL_CAMPAIGN,
};
use acremail_common::config::EmailConfig;
use acremail_common::types::{BuyerId, CampaignId};
use acremail_storage::models::{Buyer, EmailTemplate, NewTrackingEvent, TrackingEventType};
use acremail_storage::repository::TrackingRepository;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a single recipient was not sent to
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Recipient {0} has not consented to email")]
    NoConsent(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-send overrides. `context` is merged over the buyer keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentRecipient {
    pub buyer_id: BuyerId,
    pub email: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecipient {
    pub buyer_id: BuyerId,
    pub email: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendResult {
    pub sent: Vec<SentRecipient>,
    pub failed: Vec<FailedRecipient>,
    pub total_sent: usize,
    pub total_failed: usize,
}

impl BulkSendResult {
    pub fn merge(&mut self, other: BulkSendResult) {
        self.total_sent += other.total_sent;
        self.total_failed += other.total_failed;
        self.sent.extend(other.sent);
        self.failed.extend(other.failed);
    }
}

/// Sender defaults and pacing
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub from_name: String,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub unsubscribe_group_id: Option<i64>,
    pub pacing: Duration,
}

impl From<&EmailConfig> for DeliveryConfig {
    fn from(config: &EmailConfig) -> Self {
        Self {
            from_name: config.from_name.clone(),
            from_email: config.from_email.clone(),
            reply_to: config.reply_to.clone(),
            unsubscribe_group_id: Some(config.unsubscribe_group_id),
            pacing: config.pacing(),
        }
    }
}

pub struct DeliveryEngine {
    transport: Arc<dyn EmailTransport>,
    tracking: Arc<dyn TrackingRepository>,
    renderer: TemplateRenderer,
    signer: UnsubscribeSigner,
    urls: TrackingUrls,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl DeliveryEngine {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        tracking: Arc<dyn TrackingRepository>,
        signer: UnsubscribeSigner,
        urls: TrackingUrls,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            tracking,
            renderer: TemplateRenderer::new(),
            signer,
            urls,
            config,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Send `template` to every buyer. Tracking (pixel, click links and
    /// events) is on only when `campaign_id` is given.
    pub async fn send_bulk_emails(
        &self,
        buyers: &[Buyer],
        template: &EmailTemplate,
        subject: &str,
        options: &SendOptions,
        campaign_id: Option<CampaignId>,
    ) -> BulkSendResult {
        let mut result = BulkSendResult::default();

        for (index, buyer) in buyers.iter().enumerate() {
            if index > 0 && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }

            match self.send_one(buyer, template, subject, options, campaign_id).await {
                Ok(receipt) => {
                    result.sent.push(SentRecipient {
                        buyer_id: buyer.id,
                        email: buyer.email.clone(),
                        message_id: receipt.message_id,
                    });
                    result.total_sent += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.email_sent();
                    }
                }
                Err(e) => {
                    warn!(buyer_id = %buyer.id, email = %buyer.email, error = %e, "Failed to send email");
                    let error = e.to_string();
                    if let Some(campaign_id) = campaign_id {
                        self.track(
                            NewTrackingEvent::new(
                                Some(campaign_id),
                                buyer.id,
                                TrackingEventType::Failed,
                                self.clock.now(),
                            )
                            .with_metadata(json!({ "error": error })),
                        )
                        .await;
                    }
                    result.failed.push(FailedRecipient {
                        buyer_id: buyer.id,
                        email: buyer.email.clone(),
                        error,
                    });
                    result.total_failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.email_failed();
                    }
                }
            }
        }

        info!(
            campaign_id = ?campaign_id,
            sent = result.total_sent,
            failed = result.total_failed,
            "Bulk send finished"
        );
        result
    }

    /// One-recipient send; true when the provider accepted it
    pub async fn send_single_email(
        &self,
        buyer: &Buyer,
        template: &EmailTemplate,
        subject: &str,
        options: &SendOptions,
        campaign_id: Option<CampaignId>,
    ) -> bool {
        let result = self
            .send_bulk_emails(std::slice::from_ref(buyer), template, subject, options, campaign_id)
            .await;
        !result.sent.is_empty()
    }

    async fn send_one(
        &self,
        buyer: &Buyer,
        template: &EmailTemplate,
        subject: &str,
        options: &SendOptions,
        campaign_id: Option<CampaignId>,
    ) -> Result<ProviderReceipt, DeliveryError> {
        if !buyer.can_receive_email() {
            return Err(DeliveryError::NoConsent(buyer.email.clone()));
        }

        let now = self.clock.now();
        let mut ctx = RenderContext::for_buyer(buyer);
        ctx.extend(&options.context);

        let token = campaign_id.map(|campaign_id| encode_tracking_token(campaign_id, buyer.id, now));
        let pixel_url = token.as_deref().map(|token| self.urls.pixel_url(token));
        ctx.insert("trackingPixel", pixel_url.clone().unwrap_or_default());
        ctx.insert(
            "unsubscribeUrl",
            self.urls
                .unsubscribe_url(&buyer.email, &self.signer.sign(&buyer.email)),
        );

        let rendered_subject = self.renderer.render(subject, &ctx)?;
        let mut html = self.renderer.render_html(&template.html_content, &ctx)?;
        if let Some(token) = &token {
            html = self.urls.rewrite_links(&html, token);
        }
        if let Some(pixel_url) = &pixel_url {
            html.push_str(&format!(
                r#"<img src="{}" width="1" height="1" style="display:none;" />"#,
                pixel_url
            ));
        }

        let from_email = options
            .from_email
            .clone()
            .unwrap_or_else(|| self.config.from_email.clone());
        let from_name = options
            .from_name
            .clone()
            .unwrap_or_else(|| self.config.from_name.clone());

        let mut custom_args = BTreeMap::new();
        custom_args.insert(
            "campaignId".to_string(),
            campaign_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| MANUAL_CAMPAIGN.to_string()),
        );
        custom_args.insert("buyerId".to_string(), buyer.id.to_string());
        custom_args.insert("emailType".to_string(), EMAIL_TYPE_CAMPAIGN.to_string());

        let email = OutboundEmail {
            to: buyer.email.clone(),
            to_name: Some(buyer.full_name()).filter(|n| !n.is_empty()),
            from: from_email.clone(),
            from_name: from_name.clone(),
            reply_to: options.reply_to.clone().or_else(|| self.config.reply_to.clone()),
            subject: rendered_subject.clone(),
            html,
            custom_args,
            unsubscribe_group_id: self.config.unsubscribe_group_id,
        };

        let receipt = self.transport.send(&email).await?;
        debug!(buyer_id = %buyer.id, transport = self.transport.name(), "Email sent");

        if let Some(campaign_id) = campaign_id {
            self.track(
                NewTrackingEvent::new(Some(campaign_id), buyer.id, TrackingEventType::Sent, now)
                    .with_metadata(json!({
                        "subject": rendered_subject,
                        "fromEmail": from_email,
                        "fromName": from_name,
                        "messageId": receipt.message_id,
                    })),
            )
            .await;
        }

        Ok(receipt)
    }

    async fn track(&self, event: NewTrackingEvent) {
        let event_type = event.event_type;
        match self.tracking.record(event).await {
            Ok(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.tracking_event(&event_type.to_string());
                }
            }
            Err(e) => warn!(error = %e, event_type = %event_type, "Failed to record tracking event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{buyer, template, Harness};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let h = Harness::new().await;
        let buyers = vec![buyer("a@x.com"), buyer("b@x.com"), buyer("c@x.com")];
        h.transport.reject_address("b@x.com");
        let campaign_id = uuid::Uuid::new_v4();

        let result = h
            .delivery()
            .send_bulk_emails(&buyers, &template(), "Hi {{firstName}}", &SendOptions::default(), Some(campaign_id))
            .await;

        assert_eq!(result.total_sent, 2);
        assert_eq!(result.total_failed, 1);
        assert_eq!(result.total_sent + result.total_failed, buyers.len());
        assert_eq!(result.failed[0].email, "b@x.com");

        let events = h.store.tracking_events().await;
        let mut kinds: Vec<String> = events.iter().map(|e| e.event_type.clone()).collect();
        kinds.sort();
        assert_eq!(kinds, vec!["failed", "sent", "sent"]);
    }

    #[tokio::test]
    async fn test_non_consenting_buyer_never_reaches_transport() {
        let h = Harness::new().await;
        let mut out = buyer("out@x.com");
        out.email_opt_in = false;
        let mut unsub = buyer("unsub@x.com");
        unsub.email_status = "unsubscribed".to_string();

        let result = h
            .delivery()
            .send_bulk_emails(&[out, unsub], &template(), "Hi", &SendOptions::default(), Some(uuid::Uuid::new_v4()))
            .await;

        assert_eq!(result.total_failed, 2);
        assert!(h.transport.sent().is_empty());
        assert!(h
            .store
            .tracking_events()
            .await
            .iter()
            .all(|e| e.event_type == "failed"));
    }

    #[tokio::test]
    async fn test_campaign_send_embeds_pixel_and_args() {
        let h = Harness::new().await;
        let campaign_id = uuid::Uuid::new_v4();
        let b = buyer("ana@x.com");

        let sent = h
            .delivery()
            .send_single_email(&b, &template(), "For {{buyerName}}", &SendOptions::default(), Some(campaign_id))
            .await;
        assert!(sent);

        let email = &h.transport.sent()[0];
        assert_eq!(email.subject, "For Ana Buyer");
        assert!(email.html.contains("/api/email-tracking/pixel/"));
        assert!(email.html.ends_with(r#"width="1" height="1" style="display:none;" />"#));
        assert_eq!(email.custom_args["campaignId"], campaign_id.to_string());
        assert_eq!(email.custom_args["buyerId"], b.id.to_string());
        assert_eq!(email.custom_args["emailType"], "campaign");
    }

    fn linked_template() -> EmailTemplate {
        let mut t = template();
        t.html_content =
            r#"<a href="https://landivo.com/properties/1">See it</a> <a href="{{unsubscribeUrl}}">Unsubscribe</a>"#
                .into();
        t
    }

    #[tokio::test]
    async fn test_campaign_links_go_through_click_tracking() {
        let h = Harness::new().await;
        let campaign_id = uuid::Uuid::new_v4();
        let b = buyer("ana@x.com");

        assert!(
            h.delivery()
                .send_single_email(&b, &linked_template(), "Hi", &SendOptions::default(), Some(campaign_id))
                .await
        );

        let html = &h.transport.sent()[0].html;
        let token = encode_tracking_token(campaign_id, b.id, h.clock.now());
        assert!(html.contains(&format!(
            "/api/email-tracking/click/{}?url=https%3A%2F%2Flandivo.com%2Fproperties%2F1",
            token
        )));
        assert!(!html.contains(r#"href="https://landivo.com/properties/1""#));
        assert!(html.contains("unsubscribe?email=ana%40x.com"));
        assert_eq!(html.matches("/api/email-tracking/click/").count(), 1);
    }

    #[tokio::test]
    async fn test_manual_send_keeps_links() {
        let h = Harness::new().await;
        let b = buyer("ana@x.com");

        assert!(
            h.delivery()
                .send_single_email(&b, &linked_template(), "Hi", &SendOptions::default(), None)
                .await
        );

        let html = &h.transport.sent()[0].html;
        assert!(html.contains(r#"href="https://landivo.com/properties/1""#));
        assert!(!html.contains("/api/email-tracking/click/"));
    }

    #[tokio::test]
    async fn test_manual_send_has_no_pixel_or_events() {
        let h = Harness::new().await;
        let b = buyer("ana@x.com");

        assert!(
            h.delivery()
                .send_single_email(&b, &template(), "Hi", &SendOptions::default(), None)
                .await
        );

        let email = &h.transport.sent()[0];
        assert!(!email.html.contains("pixel"));
        assert_eq!(email.custom_args["campaignId"], "manual");
        assert!(h.store.tracking_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_render_failure_is_per_recipient() {
        let h = Harness::new().await;
        let buyers = vec![buyer("a@x.com"), buyer("b@x.com")];

        let result = h
            .delivery()
            .send_bulk_emails(&buyers, &template(), "{{ broken", &SendOptions::default(), None)
            .await;
        assert_eq!(result.total_failed, 2);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_recipients() {
        let h = Harness::new().await;
        let engine = h.delivery_with_pacing(Duration::from_millis(100));
        let buyers = vec![buyer("a@x.com"), buyer("b@x.com"), buyer("c@x.com")];

        let started = tokio::time::Instant::now();
        engine
            .send_bulk_emails(&buyers, &template(), "Hi", &SendOptions::default(), None)
            .await;
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}
