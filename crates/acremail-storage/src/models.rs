//! Database models

use acremail_common::types::{BuyerId, CampaignId, JobId, ListId, PropertyId, RuleId, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Buyers
// ============================================================================

/// Buyer email status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Active,
    Unsubscribed,
    Bounced,
    Complained,
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailStatus::Active => write!(f, "active"),
            EmailStatus::Unsubscribed => write!(f, "unsubscribed"),
            EmailStatus::Bounced => write!(f, "bounced"),
            EmailStatus::Complained => write!(f, "complained"),
        }
    }
}

impl std::str::FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EmailStatus::Active),
            "unsubscribed" => Ok(EmailStatus::Unsubscribed),
            "bounced" => Ok(EmailStatus::Bounced),
            "complained" => Ok(EmailStatus::Complained),
            _ => Err(format!("Invalid email status: {}", s)),
        }
    }
}

/// Source value that marks a buyer as VIP
pub const VIP_SOURCE: &str = "VIP Buyers List";

/// A land buyer that receives marketing email
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Buyer {
    pub id: BuyerId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub buyer_type: Option<String>,
    pub preferred_areas: Vec<String>,
    pub source: Option<String>,
    pub email_opt_in: bool,
    pub email_status: String,
    pub last_email_sent: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Buyer {
    /// Whether marketing email may be sent to this buyer
    pub fn can_receive_email(&self) -> bool {
        self.email_opt_in && self.email_status != EmailStatus::Unsubscribed.to_string()
    }

    /// First and last name, trimmed
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    pub fn is_vip(&self) -> bool {
        self.source.as_deref() == Some(VIP_SOURCE)
    }
}

// ============================================================================
// Email lists
// ============================================================================

/// Criteria stored on an email list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCriteria {
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub buyer_types: Vec<String>,
    #[serde(default, rename = "isVIP")]
    pub is_vip: bool,
}

impl ListCriteria {
    /// A criteria object with no constraint matches nobody
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty() && self.buyer_types.is_empty() && !self.is_vip
    }

    /// Whether the buyer satisfies every constraint that is set
    pub fn matches(&self, buyer: &Buyer) -> bool {
        if self.is_empty() {
            return false;
        }

        if !self.areas.is_empty()
            && !buyer
                .preferred_areas
                .iter()
                .any(|area| self.areas.contains(area))
        {
            return false;
        }

        if !self.buyer_types.is_empty()
            && !buyer
                .buyer_type
                .as_ref()
                .is_some_and(|t| self.buyer_types.contains(t))
        {
            return false;
        }

        if self.is_vip && !buyer.is_vip() {
            return false;
        }

        true
    }
}

/// Buyer segmentation list
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailList {
    pub id: ListId,
    pub name: String,
    pub criteria: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailList {
    /// Typed view of the stored criteria, if any
    pub fn parsed_criteria(&self) -> Option<ListCriteria> {
        self.criteria
            .as_ref()
            .and_then(|value| serde_json::from_value::<ListCriteria>(value.clone()).ok())
            .filter(|criteria| !criteria.is_empty())
    }
}

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub html_content: String,
    pub is_system_template: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Campaigns
// ============================================================================

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Queued,
    Sending,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Transitions allowed for user-initiated lifecycle actions.
    ///
    /// Forward only, except `sending|queued -> paused` and `paused -> queued`.
    /// A scheduled campaign may be rescheduled.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Queued)
                | (Scheduled, Scheduled)
                | (Scheduled, Queued)
                | (Scheduled, Failed)
                | (Queued, Sending)
                | (Queued, Paused)
                | (Queued, Failed)
                | (Sending, Paused)
                | (Sending, Completed)
                | (Sending, Failed)
                | (Paused, Queued)
        )
    }

    /// Statuses in which the campaign definition may no longer change
    pub fn is_locked(self) -> bool {
        matches!(self, CampaignStatus::Sending | CampaignStatus::Completed)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Queued => write!(f, "queued"),
            CampaignStatus::Sending => write!(f, "sending"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "queued" => Ok(CampaignStatus::Queued),
            "sending" => Ok(CampaignStatus::Sending),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    pub template_id: TemplateId,
    pub target_lists: Vec<ListId>,
    pub from_name: Option<String>,
    pub from_email: Option<String>,
    pub reply_to: Option<String>,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_sent: i32,
    pub total_failed: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Parsed status; unknown values are treated as draft
    pub fn status(&self) -> CampaignStatus {
        self.status.parse().unwrap_or(CampaignStatus::Draft)
    }
}

/// Per-recipient delivery status within a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientStatus::Pending => write!(f, "pending"),
            RecipientStatus::Sent => write!(f, "sent"),
            RecipientStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub buyer_id: BuyerId,
    pub status: String,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate recipient outcome counts for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecipientCounts {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
}

// ============================================================================
// Tracking
// ============================================================================

/// Email tracking event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventType {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Deferred,
    Unsubscribed,
    Spam,
    Failed,
}

impl std::fmt::Display for TrackingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackingEventType::Sent => "sent",
            TrackingEventType::Delivered => "delivered",
            TrackingEventType::Opened => "opened",
            TrackingEventType::Clicked => "clicked",
            TrackingEventType::Bounced => "bounced",
            TrackingEventType::Deferred => "deferred",
            TrackingEventType::Unsubscribed => "unsubscribed",
            TrackingEventType::Spam => "spam",
            TrackingEventType::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TrackingEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(TrackingEventType::Sent),
            "delivered" => Ok(TrackingEventType::Delivered),
            "opened" => Ok(TrackingEventType::Opened),
            "clicked" => Ok(TrackingEventType::Clicked),
            "bounced" => Ok(TrackingEventType::Bounced),
            "deferred" => Ok(TrackingEventType::Deferred),
            "unsubscribed" => Ok(TrackingEventType::Unsubscribed),
            "spam" => Ok(TrackingEventType::Spam),
            "failed" => Ok(TrackingEventType::Failed),
            _ => Err(format!("Invalid tracking event type: {}", s)),
        }
    }
}

/// Append-only tracking log entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailTrackingEvent {
    pub id: Uuid,
    pub campaign_id: Option<CampaignId>,
    pub buyer_id: BuyerId,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub click_url: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub provider_event_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Input for recording a tracking event
#[derive(Debug, Clone)]
pub struct NewTrackingEvent {
    pub campaign_id: Option<CampaignId>,
    pub buyer_id: BuyerId,
    pub event_type: TrackingEventType,
    pub event_timestamp: DateTime<Utc>,
    pub click_url: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub provider_event_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewTrackingEvent {
    pub fn new(
        campaign_id: Option<CampaignId>,
        buyer_id: BuyerId,
        event_type: TrackingEventType,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id,
            buyer_id,
            event_type,
            event_timestamp,
            click_url: None,
            user_agent: None,
            ip_address: None,
            provider_event_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// Automation
// ============================================================================

/// Automation trigger types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    BuyerRegistered,
    PropertyUploaded,
    PropertyPriceDrop,
    BuyerInactive,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::BuyerRegistered => write!(f, "buyer_registered"),
            TriggerType::PropertyUploaded => write!(f, "property_uploaded"),
            TriggerType::PropertyPriceDrop => write!(f, "property_price_drop"),
            TriggerType::BuyerInactive => write!(f, "buyer_inactive"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buyer_registered" => Ok(TriggerType::BuyerRegistered),
            "property_uploaded" => Ok(TriggerType::PropertyUploaded),
            "property_price_drop" => Ok(TriggerType::PropertyPriceDrop),
            "buyer_inactive" => Ok(TriggerType::BuyerInactive),
            _ => Err(format!("Invalid trigger type: {}", s)),
        }
    }
}

/// Unit of an automation rule's delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    /// Unknown units fall back to minutes
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "hours" => DelayUnit::Hours,
            "days" => DelayUnit::Days,
            _ => DelayUnit::Minutes,
        }
    }

    pub fn duration(self, amount: i32) -> chrono::Duration {
        let amount = i64::from(amount.max(0));
        match self {
            DelayUnit::Minutes => chrono::Duration::minutes(amount),
            DelayUnit::Hours => chrono::Duration::hours(amount),
            DelayUnit::Days => chrono::Duration::days(amount),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub name: String,
    pub trigger_type: String,
    pub trigger_conditions: serde_json::Value,
    pub template_id: TemplateId,
    pub target_lists: Vec<ListId>,
    pub delay: i32,
    pub delay_unit: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn trigger(&self) -> Option<TriggerType> {
        self.trigger_type.parse().ok()
    }

    /// Delay before the rule's emails go out; zero when not delayed
    pub fn delay_duration(&self) -> chrono::Duration {
        DelayUnit::parse_lenient(&self.delay_unit).duration(self.delay)
    }
}

/// Automation execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: Uuid,
    pub rule_id: RuleId,
    pub triggered_by: serde_json::Value,
    pub recipient_count: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Input for recording an automation execution
#[derive(Debug, Clone)]
pub struct NewAutomationExecution {
    pub rule_id: RuleId,
    pub triggered_by: serde_json::Value,
    pub recipient_count: i32,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

// ============================================================================
// Properties and admin users
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub title: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub property_type: Option<String>,
    pub area: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub auto_notify_on_upload: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AdminUser {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
}

// ============================================================================
// Jobs
// ============================================================================

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted queue job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for enqueueing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buyer(email: &str) -> Buyer {
        let now = Utc::now();
        Buyer {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            buyer_type: Some("Investor".to_string()),
            preferred_areas: vec!["Austin".to_string(), "Dallas".to_string()],
            source: None,
            email_opt_in: true,
            email_status: "active".to_string(),
            last_email_sent: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_buyer_consent() {
        let mut b = buyer("a@example.com");
        assert!(b.can_receive_email());

        b.email_status = "unsubscribed".to_string();
        assert!(!b.can_receive_email());

        b.email_status = "active".to_string();
        b.email_opt_in = false;
        assert!(!b.can_receive_email());
    }

    #[test]
    fn test_full_name_trimmed() {
        let mut b = buyer("a@example.com");
        b.last_name = String::new();
        assert_eq!(b.full_name(), "Jane");
    }

    #[test]
    fn test_list_criteria_matching() {
        let b = buyer("a@example.com");

        let areas = ListCriteria {
            areas: vec!["Dallas".to_string()],
            ..Default::default()
        };
        assert!(areas.matches(&b));

        let types = ListCriteria {
            buyer_types: vec!["Builder".to_string()],
            ..Default::default()
        };
        assert!(!types.matches(&b));

        let vip = ListCriteria {
            is_vip: true,
            ..Default::default()
        };
        assert!(!vip.matches(&b));

        let mut vip_buyer = buyer("vip@example.com");
        vip_buyer.source = Some(VIP_SOURCE.to_string());
        assert!(vip.matches(&vip_buyer));

        assert!(!ListCriteria::default().matches(&b));
    }

    #[test]
    fn test_list_criteria_json() {
        let criteria: ListCriteria =
            serde_json::from_value(serde_json::json!({"areas": ["Austin"], "isVIP": true}))
                .unwrap();
        assert_eq!(criteria.areas, vec!["Austin".to_string()]);
        assert!(criteria.is_vip);
        assert!(criteria.buyer_types.is_empty());
    }

    #[test]
    fn test_campaign_status_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Queued));
        assert!(Sending.can_transition_to(Paused));
        assert!(Queued.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Scheduled));
        assert!(!Sending.can_transition_to(Scheduled));
        assert!(!Paused.can_transition_to(Sending));
        assert!(Completed.is_locked());
        assert!(!Draft.is_locked());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in ["draft", "scheduled", "queued", "sending", "paused", "completed", "failed"] {
            let parsed: CampaignStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        assert!("archived".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn test_delay_unit() {
        assert_eq!(DelayUnit::parse_lenient("hours").duration(2), chrono::Duration::hours(2));
        assert_eq!(DelayUnit::parse_lenient("days").duration(1), chrono::Duration::days(1));
        assert_eq!(DelayUnit::parse_lenient("weeks").duration(3), chrono::Duration::minutes(3));
        assert_eq!(DelayUnit::Minutes.duration(-5), chrono::Duration::zero());
    }
}
