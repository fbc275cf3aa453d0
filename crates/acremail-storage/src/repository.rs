//! Repository layer for data access

pub mod automation;
pub mod buyers;
pub mod campaigns;
pub mod jobs;
pub mod lists;
pub mod properties;
pub mod recipients;
pub mod templates;
pub mod tracking;
pub mod users;

pub use automation::{AutomationRepository, DbAutomationRepository};
pub use buyers::{BuyerRepository, DbBuyerRepository, InactiveBuyerQuery};
pub use campaigns::{CampaignRepository, DbCampaignRepository};
pub use jobs::{DbJobRepository, JobRepository};
pub use lists::{DbEmailListRepository, EmailListRepository};
pub use properties::{DbPropertyRepository, PropertyRepository};
pub use recipients::{CampaignRecipientRepository, DbCampaignRecipientRepository};
pub use templates::{DbTemplateRepository, TemplateRepository};
pub use tracking::{DbTrackingRepository, TrackingRepository};
pub use users::{AdminUserRepository, DbAdminUserRepository};

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

/// Handles to every repository, shared by the services
#[derive(Clone)]
pub struct Repositories {
    pub buyers: Arc<dyn BuyerRepository>,
    pub lists: Arc<dyn EmailListRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub recipients: Arc<dyn CampaignRecipientRepository>,
    pub tracking: Arc<dyn TrackingRepository>,
    pub automation: Arc<dyn AutomationRepository>,
    pub properties: Arc<dyn PropertyRepository>,
    pub admins: Arc<dyn AdminUserRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: &DatabasePool) -> Self {
        Self {
            buyers: Arc::new(DbBuyerRepository::new(pool.clone())),
            lists: Arc::new(DbEmailListRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            recipients: Arc::new(DbCampaignRecipientRepository::new(pool.clone())),
            tracking: Arc::new(DbTrackingRepository::new(pool.clone())),
            automation: Arc::new(DbAutomationRepository::new(pool.clone())),
            properties: Arc::new(DbPropertyRepository::new(pool.clone())),
            admins: Arc::new(DbAdminUserRepository::new(pool.clone())),
            jobs: Arc::new(DbJobRepository::new(pool.clone())),
        }
    }

    /// Every repository backed by the same in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            buyers: store.clone(),
            lists: store.clone(),
            templates: store.clone(),
            campaigns: store.clone(),
            recipients: store.clone(),
            tracking: store.clone(),
            automation: store.clone(),
            properties: store.clone(),
            admins: store.clone(),
            jobs: store,
        }
    }
}
