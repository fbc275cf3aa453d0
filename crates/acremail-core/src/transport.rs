//! Transport Adapter - hands one rendered message to the email provider
//!
//! One provider call per message. No retry happens here; the job queue owns
//! retry policy.

use acremail_common::config::EmailConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Tag sent with every campaign or automation email
pub const EMAIL_TYPE_CAMPAIGN: &str = "campaign";

/// Campaign id sent for messages outside a campaign
pub const MANUAL_CAMPAIGN: &str = "manual";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// A fully rendered message ready for the provider
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub from: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: String,
    /// Echoed back by the provider in webhook events
    pub custom_args: BTreeMap<String, String>,
    pub unsubscribe_group_id: Option<i64>,
}

/// What the provider returned for an accepted message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, TransportError>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// SendGrid
// ============================================================================

#[derive(Debug, Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub api_url: String,
    pub timeout: Duration,
}

impl SendGridConfig {
    pub fn from_email_config(config: &EmailConfig) -> Option<Self> {
        Some(Self {
            api_key: config.sendgrid_api_key.clone()?,
            api_url: config.sendgrid_api_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }
}

/// SendGrid v3 mail send API
pub struct SendGridTransport {
    config: SendGridConfig,
    client: Client,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }
}

#[derive(Debug, Serialize)]
struct SendGridRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address<'a>>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    asm: Option<Asm>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    custom_args: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct Asm {
    group_id: i64,
}

#[derive(Debug, Deserialize)]
struct SendGridErrors {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

#[async_trait]
impl EmailTransport for SendGridTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, TransportError> {
        let request = SendGridRequest {
            personalizations: vec![Personalization {
                to: vec![Address {
                    email: &email.to,
                    name: email.to_name.as_deref().filter(|n| !n.is_empty()),
                }],
                custom_args: &email.custom_args,
            }],
            from: Address {
                email: &email.from,
                name: Some(&email.from_name),
            },
            reply_to: email.reply_to.as_deref().map(|addr| Address {
                email: addr,
                name: None,
            }),
            subject: &email.subject,
            content: vec![Content {
                content_type: "text/html",
                value: &email.html,
            }],
            asm: email.unsubscribe_group_id.map(|group_id| Asm { group_id }),
        };

        debug!(to = %email.to, subject = %email.subject, "Sending email via SendGrid");

        let response = self
            .client
            .post(format!("{}/mail/send", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            debug!(to = %email.to, message_id = ?message_id, "SendGrid accepted message");
            return Ok(ProviderReceipt { message_id });
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<SendGridErrors>(&body) {
            Ok(parsed) if !parsed.errors.is_empty() => parsed
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join(", "),
            _ => body,
        };

        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }
}

// ============================================================================
// Log transport
// ============================================================================

/// Accepts everything without a network call and keeps what it was given
#[derive(Default)]
pub struct LogTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    reject: Mutex<Vec<String>>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `address` fail
    pub fn reject_address(&self, address: &str) {
        if let Ok(mut reject) = self.reject.lock() {
            reject.push(address.to_lowercase());
        }
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<ProviderReceipt, TransportError> {
        let rejected = self
            .reject
            .lock()
            .map(|r| r.contains(&email.to.to_lowercase()))
            .unwrap_or(false);

        if rejected {
            return Err(TransportError::Rejected {
                status: 400,
                message: format!("Recipient {} rejected", email.to),
            });
        }

        info!(to = %email.to, subject = %email.subject, "Email accepted by log transport");

        let mut sent = match self.sent.lock() {
            Ok(sent) => sent,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push(email.clone());

        Ok(ProviderReceipt {
            message_id: Some(format!("log-{}", sent.len())),
        })
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
