//! Job Queue - durable email jobs with retry

mod jobs;
mod manager;

pub use jobs::{
    BulkEmailJob, BulkEmailOptions, CampaignJob, EmailJobExecutor, JobKind, SEND_BULK_EMAILS,
    SEND_CAMPAIGN,
};
pub use manager::{calculate_backoff, JobContext, JobExecutor, JobQueue, QueueSettings};
