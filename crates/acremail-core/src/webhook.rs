//! SendGrid event webhook translation
//!
//! Provider vocabulary stays in this module; the rest of the crate only sees
//! `TrackingEventType` and typed ids.

use crate::transport::MANUAL_CAMPAIGN;
use acremail_common::types::{BuyerId, CampaignId};
use acremail_storage::models::TrackingEventType;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Map a SendGrid event name to the internal event type
pub fn translate_event_type(event: &str) -> Option<TrackingEventType> {
    match event {
        "delivered" => Some(TrackingEventType::Delivered),
        "open" => Some(TrackingEventType::Opened),
        "click" => Some(TrackingEventType::Clicked),
        "bounce" => Some(TrackingEventType::Bounced),
        "dropped" => Some(TrackingEventType::Failed),
        "deferred" => Some(TrackingEventType::Deferred),
        "unsubscribe" => Some(TrackingEventType::Unsubscribed),
        "spamreport" => Some(TrackingEventType::Spam),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomArgs {
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub buyer_id: Option<String>,
}

/// One entry of a webhook batch. Every field is optional so a malformed
/// event never rejects the batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEvent {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub sg_event_id: Option<String>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub useragent: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, rename = "customArgs", alias = "custom_args")]
    pub custom_args: Option<CustomArgs>,
    /// SendGrid also flattens custom args into the event itself
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Who an event is about. `campaign_id` is `None` for manual sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTarget {
    pub campaign_id: Option<CampaignId>,
    pub buyer_id: BuyerId,
}

impl ProviderEvent {
    /// Lenient parse; `None` when the value is not an object
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn event_type(&self) -> Option<TrackingEventType> {
        self.event.as_deref().and_then(translate_event_type)
    }

    fn custom_arg(&self, key: &str) -> Option<String> {
        let nested = self.custom_args.as_ref().and_then(|args| match key {
            "campaignId" => args.campaign_id.clone(),
            _ => args.buyer_id.clone(),
        });
        nested
            .or_else(|| self.extra.get(key).and_then(Value::as_str).map(str::to_string))
            .filter(|v| !v.is_empty())
    }

    /// Both tracking args must be present and well-formed
    pub fn target(&self) -> Option<EventTarget> {
        let campaign = self.custom_arg("campaignId")?;
        let buyer_id = Uuid::parse_str(&self.custom_arg("buyerId")?).ok()?;

        let campaign_id = if campaign == MANUAL_CAMPAIGN {
            None
        } else {
            Some(Uuid::parse_str(&campaign).ok()?)
        };

        Some(EventTarget {
            campaign_id,
            buyer_id,
        })
    }

    /// Event time from the unix `timestamp`, when it is usable
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        let seconds = match self.timestamp.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Utc.timestamp_opt(seconds, 0).single()
    }

    /// Provider details kept with the tracking row
    pub fn metadata(&self) -> Value {
        json!({
            "sendgridEventId": self.sg_event_id,
            "sendgridMessageId": self.sg_message_id,
            "timestamp": self.timestamp,
            "email": self.email,
            "url": self.url,
            "reason": self.reason,
            "userAgent": self.useragent,
            "ip": self.ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_translate_event_type() {
        assert_eq!(translate_event_type("open"), Some(TrackingEventType::Opened));
        assert_eq!(translate_event_type("dropped"), Some(TrackingEventType::Failed));
        assert_eq!(translate_event_type("spamreport"), Some(TrackingEventType::Spam));
        assert_eq!(translate_event_type("processed"), None);
    }

    #[test]
    fn test_target_from_custom_args() {
        let campaign = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let event = ProviderEvent::from_value(json!({
            "event": "open",
            "customArgs": { "campaignId": campaign.to_string(), "buyerId": buyer.to_string() }
        }))
        .unwrap();

        assert_eq!(
            event.target(),
            Some(EventTarget {
                campaign_id: Some(campaign),
                buyer_id: buyer
            })
        );
    }

    #[test]
    fn test_target_from_flattened_args() {
        let buyer = Uuid::new_v4();
        let event = ProviderEvent::from_value(json!({
            "event": "delivered",
            "campaignId": "manual",
            "buyerId": buyer.to_string(),
            "timestamp": 1700000000
        }))
        .unwrap();

        let target = event.target().unwrap();
        assert_eq!(target.campaign_id, None);
        assert_eq!(target.buyer_id, buyer);
        assert_eq!(event.occurred_at().unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn test_missing_or_bad_args() {
        let none = ProviderEvent::from_value(json!({ "event": "open" })).unwrap();
        assert_eq!(none.target(), None);

        let bad_buyer = ProviderEvent::from_value(json!({
            "event": "open",
            "customArgs": { "campaignId": "manual", "buyerId": "not-a-uuid" }
        }))
        .unwrap();
        assert_eq!(bad_buyer.target(), None);

        assert!(ProviderEvent::from_value(json!("open")).is_none());
    }
}
