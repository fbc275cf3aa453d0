//! Fixtures for unit tests: rows with sensible defaults and a fully wired
//! in-memory service graph

use crate::audience::AudienceResolver;
use crate::automation::AutomationEngine;
use crate::campaign::CampaignManager;
use crate::clock::{Clock, ManualClock};
use crate::delivery::{DeliveryConfig, DeliveryEngine};
use crate::queue::{EmailJobExecutor, JobQueue, QueueSettings};
use crate::scheduler::Scheduler;
use crate::tokens::{TrackingUrls, UnsubscribeSigner};
use crate::tracking::TrackingService;
use crate::transport::LogTransport;
use acremail_common::config::{SchedulerConfig, TrackingConfig};
use acremail_common::types::{CampaignId, ListId, TemplateId};
use acremail_storage::memory::MemoryStore;
use acremail_storage::models::{
    AdminUser, AutomationRule, Buyer, Campaign, CampaignStatus, EmailList, EmailTemplate,
    EmailTrackingEvent, Property, TriggerType,
};
use acremail_storage::repository::Repositories;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-unsubscribe-secret";

pub fn buyer(email: &str) -> Buyer {
    let now = Utc::now();
    Buyer {
        id: Uuid::new_v4(),
        email: email.to_string(),
        first_name: "Ana".into(),
        last_name: "Buyer".into(),
        buyer_type: Some("Investor".into()),
        preferred_areas: vec!["Dallas".into()],
        source: None,
        email_opt_in: true,
        email_status: "active".into(),
        last_email_sent: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn template() -> EmailTemplate {
    let now = Utc::now();
    EmailTemplate {
        id: Uuid::new_v4(),
        name: "Property Alert".into(),
        subject: "New land for {{firstName}}".into(),
        html_content: "<p>Hello {{firstName}}</p>".into(),
        is_system_template: false,
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn list(criteria: Option<Value>) -> EmailList {
    let now = Utc::now();
    EmailList {
        id: Uuid::new_v4(),
        name: "Dallas investors".into(),
        criteria,
        created_at: now,
        updated_at: now,
    }
}

pub fn campaign(template_id: TemplateId, target_lists: Vec<ListId>, status: CampaignStatus) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        name: "Spring land sale".into(),
        subject: "Spring land sale".into(),
        template_id,
        target_lists,
        from_name: None,
        from_email: None,
        reply_to: None,
        status: status.to_string(),
        scheduled_at: None,
        sent_at: None,
        completed_at: None,
        total_sent: 0,
        total_failed: 0,
        error_message: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn rule(trigger: TriggerType, template_id: TemplateId, target_lists: Vec<ListId>) -> AutomationRule {
    let now = Utc::now();
    AutomationRule {
        id: Uuid::new_v4(),
        name: format!("{} rule", trigger),
        trigger_type: trigger.to_string(),
        trigger_conditions: json!({}),
        template_id,
        target_lists,
        delay: 0,
        delay_unit: "minutes".into(),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn property(price: f64) -> Property {
    Property {
        id: Uuid::new_v4(),
        title: "10 acres off FM 455".into(),
        price,
        original_price: None,
        property_type: Some("Land".into()),
        area: Some("Dallas".into()),
        city: Some("Celina".into()),
        state: Some("TX".into()),
        auto_notify_on_upload: true,
        created_at: Utc::now(),
    }
}

pub fn tracking_event(campaign_id: Option<CampaignId>, kind: &str, at: DateTime<Utc>) -> EmailTrackingEvent {
    EmailTrackingEvent {
        id: Uuid::new_v4(),
        campaign_id,
        buyer_id: Uuid::new_v4(),
        event_type: kind.to_string(),
        event_timestamp: at,
        click_url: None,
        user_agent: None,
        ip_address: None,
        provider_event_id: None,
        metadata: json!({}),
    }
}

pub fn admin(email: &str) -> AdminUser {
    AdminUser {
        id: Uuid::new_v4(),
        email: email.to_string(),
        first_name: Some("Ops".into()),
        last_name: None,
        is_active: true,
    }
}

/// In-memory store plus every service built on top of it, sharing one
/// manual clock and one recording transport
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
    pub transport: Arc<LogTransport>,
    pub clock: Arc<ManualClock>,
    pub signer: UnsubscribeSigner,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            repos: Repositories::in_memory(store.clone()),
            store,
            transport: Arc::new(LogTransport::new()),
            clock: Arc::new(ManualClock::new(Utc::now())),
            signer: UnsubscribeSigner::new(TEST_SECRET),
        }
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn delivery_with_pacing(&self, pacing: Duration) -> DeliveryEngine {
        let tracking = TrackingConfig::default();
        DeliveryEngine::new(
            self.transport.clone(),
            self.repos.tracking.clone(),
            self.signer.clone(),
            TrackingUrls::new(tracking.base_url),
            DeliveryConfig {
                from_name: "Landivo".into(),
                from_email: "deals@landivo.com".into(),
                reply_to: None,
                unsubscribe_group_id: None,
                pacing,
            },
        )
        .with_clock(self.clock())
    }

    pub fn delivery(&self) -> DeliveryEngine {
        self.delivery_with_pacing(Duration::ZERO)
    }

    pub fn audience(&self) -> AudienceResolver {
        AudienceResolver::new(self.repos.lists.clone(), self.repos.buyers.clone())
    }

    pub fn executor(&self) -> EmailJobExecutor {
        EmailJobExecutor::new(&self.repos, Arc::new(self.delivery()))
            .with_clock(self.clock())
            .with_batching(50, Duration::ZERO)
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(
            self.repos.jobs.clone(),
            Arc::new(self.executor()),
            QueueSettings::default(),
        )
        .with_clock(self.clock())
    }

    pub fn automation(&self) -> AutomationEngine {
        AutomationEngine::new(
            &self.repos,
            self.queue(),
            Arc::new(self.delivery()),
            "https://landivo.com",
        )
        .with_clock(self.clock())
    }

    pub fn campaigns(&self) -> CampaignManager {
        CampaignManager::new(&self.repos, self.queue(), Arc::new(self.delivery()))
            .with_clock(self.clock())
    }

    pub fn tracking(&self) -> TrackingService {
        TrackingService::new(&self.repos, self.signer.clone(), &TrackingConfig::default())
            .with_clock(self.clock())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            &self.repos,
            self.queue(),
            Arc::new(self.automation()),
            SchedulerConfig::default(),
        )
        .with_clock(self.clock())
    }
}
