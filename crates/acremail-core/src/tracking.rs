//! Tracking service: opens, clicks, provider webhooks and unsubscribes
//!
//! Token problems never surface to the caller. Opens and clicks with a bad
//! token record nothing and still get a pixel or a redirect.

use crate::clock::{Clock, SystemClock};
use crate::metrics::Metrics;
use crate::tokens::{decode_tracking_token, UnsubscribeSigner};
use crate::webhook::ProviderEvent;
use acremail_common::config::TrackingConfig;
use acremail_common::types::normalize_email;
use acremail_storage::models::{NewTrackingEvent, TrackingEventType};
use acremail_storage::repository::{BuyerRepository, Repositories, TrackingRepository};
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// What the HTTP layer knows about the request
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum UnsubscribeError {
    #[error("Email and token are required")]
    MissingFields,

    #[error("Invalid unsubscribe token")]
    InvalidToken,

    #[error("Email address not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] acremail_common::Error),
}

pub struct TrackingService {
    tracking: Arc<dyn TrackingRepository>,
    buyers: Arc<dyn BuyerRepository>,
    signer: UnsubscribeSigner,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
    open_dedup_window: chrono::Duration,
    default_redirect: String,
}

impl TrackingService {
    pub fn new(repos: &Repositories, signer: UnsubscribeSigner, config: &TrackingConfig) -> Self {
        let window = i64::try_from(config.open_dedup_window_secs).unwrap_or(i64::MAX / 1000);
        Self {
            tracking: repos.tracking.clone(),
            buyers: repos.buyers.clone(),
            signer,
            clock: Arc::new(SystemClock),
            metrics: None,
            open_dedup_window: chrono::Duration::seconds(window),
            default_redirect: config.frontend_url.clone(),
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

    pub fn default_redirect(&self) -> &str {
        &self.default_redirect
    }

    async fn store(&self, event: NewTrackingEvent) -> bool {
        let event_type = event.event_type;
        match self.tracking.record(event).await {
            Ok(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics.tracking_event(&event_type.to_string());
                }
                true
            }
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Failed to record tracking event");
                false
            }
        }
    }

    /// Record an open unless one was already seen inside the dedup window.
    /// Returns whether a new event was written.
    pub async fn record_open(&self, token: &str, meta: RequestMeta) -> bool {
        let Some(decoded) = decode_tracking_token(token) else {
            debug!("Ignoring open with undecodable token");
            return false;
        };

        let now = self.clock.now();
        let since = now - self.open_dedup_window;
        match self
            .tracking
            .has_event_since(
                Some(decoded.campaign_id),
                decoded.buyer_id,
                TrackingEventType::Opened,
                since,
            )
            .await
        {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Failed to check for a recent open");
                return false;
            }
        }

        let mut event = NewTrackingEvent::new(
            Some(decoded.campaign_id),
            decoded.buyer_id,
            TrackingEventType::Opened,
            now,
        )
        .with_metadata(json!({ "trackingToken": token }));
        event.ip_address = meta.ip_address;
        event.user_agent = meta.user_agent;

        let recorded = self.store(event).await;
        if recorded {
            info!(campaign_id = %decoded.campaign_id, buyer_id = %decoded.buyer_id, "Email open tracked");
        }
        recorded
    }

    /// Record a click and return where to send the reader
    pub async fn record_click(&self, token: &str, url: Option<&str>, meta: RequestMeta) -> String {
        let target = url.filter(|u| is_redirectable(u));

        if let Some(decoded) = decode_tracking_token(token) {
            let mut event = NewTrackingEvent::new(
                Some(decoded.campaign_id),
                decoded.buyer_id,
                TrackingEventType::Clicked,
                self.clock.now(),
            )
            .with_metadata(json!({
                "trackingToken": token,
                "referrer": meta.referrer,
            }));
            event.click_url = url.map(str::to_string);
            event.ip_address = meta.ip_address;
            event.user_agent = meta.user_agent;

            if self.store(event).await {
                info!(
                    campaign_id = %decoded.campaign_id,
                    buyer_id = %decoded.buyer_id,
                    url = ?url,
                    "Email click tracked"
                );
            }
        } else {
            debug!("Ignoring click with undecodable token");
        }

        target
            .map(str::to_string)
            .unwrap_or_else(|| self.default_redirect.clone())
    }

    /// Record a batch of provider events. Events without tracking args or
    /// with an unknown type are skipped; a bad event never stops the batch.
    pub async fn process_webhook(&self, events: Vec<Value>) -> WebhookSummary {
        let mut summary = WebhookSummary::default();

        for value in events {
            let Some(event) = ProviderEvent::from_value(value) else {
                summary.skipped += 1;
                continue;
            };
            let (Some(target), Some(event_type)) = (event.target(), event.event_type()) else {
                debug!(event = ?event.event, "Skipping webhook event without tracking info");
                summary.skipped += 1;
                continue;
            };

            let mut record = NewTrackingEvent::new(
                target.campaign_id,
                target.buyer_id,
                event_type,
                event.occurred_at().unwrap_or_else(|| self.clock.now()),
            )
            .with_metadata(event.metadata());
            record.click_url = event.url.clone();
            record.user_agent = event.useragent.clone();
            record.ip_address = event.ip.clone();
            record.provider_event_id = event.sg_event_id.clone();

            if !self.store(record).await {
                summary.failed += 1;
                continue;
            }

            if event_type == TrackingEventType::Unsubscribed {
                let changed = match event.email.as_deref() {
                    Some(email) => self.buyers.unsubscribe_by_email(email, self.clock.now()).await,
                    None => self.buyers.unsubscribe(target.buyer_id, self.clock.now()).await,
                };
                if let Err(e) = changed {
                    warn!(buyer_id = %target.buyer_id, error = %e, "Failed to apply webhook unsubscribe");
                    summary.failed += 1;
                    continue;
                }
            }

            summary.processed += 1;
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Webhook batch processed"
        );
        summary
    }

    /// Opt out the buyer at `email` when `token` was signed for that address
    pub async fn unsubscribe(&self, email: &str, token: &str) -> Result<(), UnsubscribeError> {
        if email.trim().is_empty() || token.trim().is_empty() {
            return Err(UnsubscribeError::MissingFields);
        }
        if !self.signer.verify(token, email) {
            return Err(UnsubscribeError::InvalidToken);
        }

        let changed = self
            .buyers
            .unsubscribe_by_email(&normalize_email(email), self.clock.now())
            .await?;
        if changed == 0 {
            return Err(UnsubscribeError::NotFound);
        }

        info!(email = %normalize_email(email), "Buyer unsubscribed");
        Ok(())
    }
}

/// Only absolute http(s) targets are followed
fn is_redirectable(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{buyer, Harness};
    use crate::tokens::encode_tracking_token;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn opens(events: &[acremail_storage::models::EmailTrackingEvent]) -> usize {
        events.iter().filter(|e| e.event_type == "opened").count()
    }

    #[tokio::test]
    async fn test_open_is_idempotent_within_window() {
        let h = Harness::new().await;
        let service = h.tracking();
        let token = encode_tracking_token(Uuid::new_v4(), Uuid::new_v4(), h.clock.now());

        assert!(service.record_open(&token, RequestMeta::default()).await);
        for _ in 0..3 {
            assert!(!service.record_open(&token, RequestMeta::default()).await);
        }
        h.clock.advance(chrono::Duration::minutes(59));
        assert!(!service.record_open(&token, RequestMeta::default()).await);
        assert_eq!(opens(&h.store.tracking_events().await), 1);

        h.clock.advance(chrono::Duration::minutes(2));
        assert!(service.record_open(&token, RequestMeta::default()).await);
        assert_eq!(opens(&h.store.tracking_events().await), 2);
    }

    #[tokio::test]
    async fn test_bad_token_records_nothing() {
        let h = Harness::new().await;
        let service = h.tracking();

        assert!(!service.record_open("garbage!!", RequestMeta::default()).await);
        let target = service
            .record_click("garbage!!", Some("https://landivo.com/p/1"), RequestMeta::default())
            .await;
        assert_eq!(target, "https://landivo.com/p/1");
        assert!(h.store.tracking_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_click_records_and_redirects() {
        let h = Harness::new().await;
        let service = h.tracking();
        let (campaign, buyer_id) = (Uuid::new_v4(), Uuid::new_v4());
        let token = encode_tracking_token(campaign, buyer_id, h.clock.now());
        let meta = RequestMeta {
            ip_address: Some("203.0.113.9".into()),
            user_agent: Some("Mail/1.0".into()),
            referrer: None,
        };

        let target = service.record_click(&token, Some("https://landivo.com/p/1"), meta).await;
        assert_eq!(target, "https://landivo.com/p/1");

        let events = h.store.tracking_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "clicked");
        assert_eq!(events[0].campaign_id, Some(campaign));
        assert_eq!(events[0].click_url.as_deref(), Some("https://landivo.com/p/1"));
        assert_eq!(events[0].ip_address.as_deref(), Some("203.0.113.9"));

        // relative or missing targets fall back to the site
        let fallback = service.record_click(&token, Some("javascript:alert(1)"), RequestMeta::default()).await;
        assert_eq!(fallback, service.default_redirect());
        let fallback = service.record_click(&token, None, RequestMeta::default()).await;
        assert_eq!(fallback, service.default_redirect());
    }

    #[tokio::test]
    async fn test_webhook_skips_events_without_args() {
        let h = Harness::new().await;
        let summary = h
            .tracking()
            .process_webhook(vec![
                json!({ "event": "open", "email": "a@x.com" }),
                json!({ "event": "open", "customArgs": {} }),
                json!(42),
            ])
            .await;

        assert_eq!(summary, WebhookSummary { processed: 0, skipped: 3, failed: 0 });
        assert!(h.store.tracking_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_records_and_unsubscribes() {
        let h = Harness::new().await;
        let b = buyer("Ana@X.com");
        h.store.insert_buyer(b.clone()).await;
        let campaign = Uuid::new_v4();
        let args = json!({ "campaignId": campaign.to_string(), "buyerId": b.id.to_string() });

        let summary = h
            .tracking()
            .process_webhook(vec![
                json!({ "event": "delivered", "customArgs": args.clone(), "sg_event_id": "ev-1" }),
                json!({ "event": "unsubscribe", "customArgs": args.clone(), "email": "ana@x.com" }),
                json!({ "event": "processed", "customArgs": args }),
            ])
            .await;
        assert_eq!(summary, WebhookSummary { processed: 2, skipped: 1, failed: 0 });

        let events = h.store.tracking_events().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["delivered", "unsubscribed"]);
        assert_eq!(events[0].provider_event_id.as_deref(), Some("ev-1"));

        let stored = BuyerRepository::get(h.store.as_ref(), b.id).await.unwrap().unwrap();
        assert!(!stored.email_opt_in);
        assert_eq!(stored.email_status, "unsubscribed");
    }

    #[tokio::test]
    async fn test_unsubscribe_token_binding() {
        let h = Harness::new().await;
        h.store.insert_buyer(buyer("a@x.com")).await;
        h.store.insert_buyer(buyer("b@x.com")).await;
        let service = h.tracking();
        let token_a = h.signer.sign("a@x.com");

        assert!(matches!(
            service.unsubscribe("b@x.com", &token_a).await,
            Err(UnsubscribeError::InvalidToken)
        ));
        assert!(matches!(
            service.unsubscribe("", &token_a).await,
            Err(UnsubscribeError::MissingFields)
        ));
        service.unsubscribe("A@x.com", &token_a).await.unwrap();

        let token_c = h.signer.sign("c@x.com");
        assert!(matches!(
            service.unsubscribe("c@x.com", &token_c).await,
            Err(UnsubscribeError::NotFound)
        ));
    }
}
