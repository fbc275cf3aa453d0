//! acremail Core - email delivery and marketing automation
//!
//! This crate holds the service layer: audience resolution, template
//! rendering, delivery through a provider, the durable job queue, campaign
//! lifecycle, automation rules, engagement tracking and the cron scheduler.

pub mod audience;
pub mod automation;
pub mod campaign;
pub mod clock;
pub mod delivery;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod template;
pub mod tokens;
pub mod tracking;
pub mod transport;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use audience::AudienceResolver;
pub use automation::{matches_trigger, AutomationEngine, TriggerConditions, TriggerData};
pub use campaign::{CampaignError, CampaignManager, EmailStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{BulkSendResult, DeliveryConfig, DeliveryEngine, SendOptions};
pub use metrics::Metrics;
pub use queue::{EmailJobExecutor, JobKind, JobQueue, QueueSettings};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use template::{RenderContext, TemplateRenderer};
pub use tokens::{TrackingToken, TrackingUrls, UnsubscribeSigner};
pub use tracking::{RequestMeta, TrackingService, UnsubscribeError, WebhookSummary};
pub use transport::{EmailTransport, LogTransport, SendGridConfig, SendGridTransport};
