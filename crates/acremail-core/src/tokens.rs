//! Tracking and unsubscribe tokens
//!
//! Tracking tokens are plain base64url of `campaign:buyer:millis`. They are
//! not signed; a forged token can only misattribute an open or click.
//! Unsubscribe tokens carry an HMAC-SHA256 of the lower-cased address.

use acremail_common::types::{normalize_email, BuyerId, CampaignId};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Decoded pixel/click token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingToken {
    pub campaign_id: CampaignId,
    pub buyer_id: BuyerId,
    pub issued_at: DateTime<Utc>,
}

pub fn encode_tracking_token(
    campaign_id: CampaignId,
    buyer_id: BuyerId,
    issued_at: DateTime<Utc>,
) -> String {
    let raw = format!("{}:{}:{}", campaign_id, buyer_id, issued_at.timestamp_millis());
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Returns `None` for anything that is not a well-formed token
pub fn decode_tracking_token(token: &str) -> Option<TrackingToken> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| URL_SAFE.decode(token))
        .ok()?;
    let raw = String::from_utf8(bytes).ok()?;

    let mut parts = raw.splitn(3, ':');
    let campaign_id = parts.next()?.parse().ok()?;
    let buyer_id = parts.next()?.parse().ok()?;
    let millis: i64 = parts.next()?.parse().ok()?;
    let issued_at = Utc.timestamp_millis_opt(millis).single()?;

    Some(TrackingToken {
        campaign_id,
        buyer_id,
        issued_at,
    })
}

/// Signs and verifies unsubscribe tokens with a server secret
#[derive(Clone)]
pub struct UnsubscribeSigner {
    secret: Vec<u8>,
}

impl UnsubscribeSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, email: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(normalize_email(email).as_bytes());
        mac
    }

    pub fn sign(&self, email: &str) -> String {
        let signature = hex::encode(self.mac(email).finalize().into_bytes());
        let raw = format!("{}:{}", normalize_email(email), signature);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// True only if the token was issued for exactly this address
    pub fn verify(&self, token: &str, email: &str) -> bool {
        let Some(raw) = URL_SAFE_NO_PAD
            .decode(token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        else {
            return false;
        };

        let Some((token_email, signature)) = raw.rsplit_once(':') else {
            return false;
        };

        if normalize_email(token_email) != normalize_email(email) {
            return false;
        }

        let Ok(signature) = hex::decode(signature) else {
            return false;
        };

        self.mac(email).verify_slice(&signature).is_ok()
    }
}

impl std::fmt::Debug for UnsubscribeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeSigner").finish_non_exhaustive()
    }
}

/// Public URLs embedded in outgoing mail
#[derive(Debug, Clone)]
pub struct TrackingUrls {
    base_url: String,
}

impl TrackingUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/email-tracking/{}", self.base_url, path)
    }

    pub fn pixel_url(&self, token: &str) -> String {
        self.endpoint(&format!("pixel/{}", token))
    }

    pub fn click_url(&self, token: &str, target: &str) -> String {
        let base = self.endpoint(&format!("click/{}", token));
        match Url::parse_with_params(&base, &[("url", target)]) {
            Ok(url) => url.to_string(),
            Err(_) => base,
        }
    }

    /// Point every absolute `href` in `html` at the click endpoint. Links
    /// already under the tracking endpoints are left alone.
    pub fn rewrite_links(&self, html: &str, token: &str) -> String {
        const ATTR: &str = "href=\"";

        let own = self.endpoint("");
        let mut out = String::with_capacity(html.len());
        let mut rest = html;

        while let Some(start) = rest.find(ATTR) {
            let value_start = start + ATTR.len();
            let Some(len) = rest[value_start..].find('"') else {
                break;
            };
            let raw = &rest[value_start..value_start + len];
            out.push_str(&rest[..value_start]);

            let target = unescape_html(raw);
            if is_web_link(&target) && !target.starts_with(&own) {
                out.push_str(&self.click_url(token, &target));
            } else {
                out.push_str(raw);
            }
            rest = &rest[value_start + len..];
        }

        out.push_str(rest);
        out
    }

    pub fn unsubscribe_url(&self, email: &str, token: &str) -> String {
        let base = self.endpoint("unsubscribe");
        match Url::parse_with_params(&base, &[("email", email), ("token", token)]) {
            Ok(url) => url.to_string(),
            Err(_) => base,
        }
    }
}

fn is_web_link(target: &str) -> bool {
    let lower = target.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Undo the entity escaping applied to substituted values
fn unescape_html(value: &str) -> String {
    value
        .replace("&#x2f;", "/")
        .replace("&#x27;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
