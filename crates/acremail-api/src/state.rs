//! Shared handler state

use acremail_core::{CampaignManager, Metrics, TrackingService};
use acremail_storage::DatabasePool;
use std::sync::Arc;

/// Everything the handlers reach for. The pool is optional so the router
/// can run against in-memory repositories.
#[derive(Clone)]
pub struct AppState {
    pub tracking: Arc<TrackingService>,
    pub campaigns: Arc<CampaignManager>,
    pub metrics: Metrics,
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    pub fn new(tracking: Arc<TrackingService>, campaigns: Arc<CampaignManager>, metrics: Metrics) -> Self {
        Self {
            tracking,
            campaigns,
            metrics,
            db_pool: None,
        }
    }

    pub fn with_db_pool(mut self, pool: DatabasePool) -> Self {
        self.db_pool = Some(pool);
        self
    }
}
