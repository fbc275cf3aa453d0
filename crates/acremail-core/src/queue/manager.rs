//! Job Queue - persisted work queue with retry and backoff

use super::jobs::{BulkEmailJob, BulkEmailOptions, CampaignJob, JobKind};
use crate::clock::{Clock, SystemClock};
use crate::metrics::Metrics;
use acremail_common::config::QueueConfig;
use acremail_common::types::{BuyerId, CampaignId, JobId, TemplateId};
use acremail_storage::models::{Job, JobStatus, NewJob, QueueStats};
use acremail_storage::repository::JobRepository;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs one job. An `Err` counts as a failed attempt.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &JobKind, ctx: &JobContext) -> Result<serde_json::Value>;

    /// Called when a job is failed without running, which happens when
    /// its last attempt was lost with a stalled worker
    async fn abandon(&self, _job: &JobKind, _error: &str) {}
}

const STALLED_ERROR: &str = "Worker stopped before the job finished";

/// Handle given to a running job
pub struct JobContext {
    pub job_id: JobId,
    /// 1-based attempt number
    pub attempt: i32,
    jobs: Arc<dyn JobRepository>,
}

impl JobContext {
    pub fn new(job_id: JobId, attempt: i32, jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            job_id,
            attempt,
            jobs,
        }
    }

    pub async fn report_progress(&self, percent: i32) {
        let percent = percent.clamp(0, 100);
        if let Err(e) = self.jobs.update_progress(self.job_id, percent).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to update job progress");
        }
    }
}

/// Tunables, normally taken from `[queue]`
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub batch_size: usize,
    pub stagger: Duration,
    pub keep_completed: i64,
    pub keep_failed: i64,
    pub retention: chrono::Duration,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub stall_timeout: chrono::Duration,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base(),
            batch_size: config.batch_size.max(1),
            stagger: config.stagger(),
            keep_completed: config.keep_completed,
            keep_failed: config.keep_failed,
            retention: chrono::Duration::hours(config.retention_hours),
            poll_interval: config.poll_interval(),
            concurrency: config.concurrency.max(1),
            stall_timeout: to_chrono(config.stall_timeout()),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Cloneable handle; clones share the same repository and executor
#[derive(Clone)]
pub struct JobQueue {
    jobs: Arc<dyn JobRepository>,
    executor: Arc<dyn JobExecutor>,
    settings: Arc<QueueSettings>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        executor: Arc<dyn JobExecutor>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            jobs,
            executor,
            settings: Arc::new(settings),
            clock: Arc::new(SystemClock),
            metrics: None,
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

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Persist a job to run at `run_at`
    pub async fn enqueue(&self, kind: JobKind, run_at: DateTime<Utc>) -> Result<JobId> {
        let job = self
            .jobs
            .insert(NewJob {
                queue: kind.name().to_string(),
                payload: serde_json::to_value(&kind)?,
                max_attempts: self.settings.max_attempts,
                scheduled_at: run_at,
                created_at: self.clock.now(),
            })
            .await?;

        debug!(job_id = %job.id, queue = %job.queue, run_at = %run_at, "Enqueued job");
        Ok(job.id)
    }

    pub async fn enqueue_campaign(&self, campaign_id: CampaignId) -> Result<JobId> {
        let job_id = self
            .enqueue(
                JobKind::SendCampaign(CampaignJob { campaign_id }),
                self.clock.now(),
            )
            .await?;
        info!(campaign_id = %campaign_id, job_id = %job_id, "Campaign queued for sending");
        Ok(job_id)
    }

    /// Split `buyer_ids` into batches; batch `i` runs at
    /// `now + start_delay + i * stagger`
    pub async fn enqueue_bulk_emails(
        &self,
        buyer_ids: &[BuyerId],
        template_id: TemplateId,
        options: BulkEmailOptions,
        start_delay: chrono::Duration,
    ) -> Result<Vec<JobId>> {
        let batches: Vec<&[BuyerId]> = buyer_ids.chunks(self.settings.batch_size).collect();
        let total_batches = batches.len();
        let now = self.clock.now();
        let stagger = to_chrono(self.settings.stagger);

        let mut ids = Vec::with_capacity(total_batches);
        for (index, batch) in batches.into_iter().enumerate() {
            let run_at = now + start_delay + stagger * index as i32;
            let kind = JobKind::SendBulkEmails(BulkEmailJob {
                buyer_ids: batch.to_vec(),
                template_id,
                options: options.clone(),
                batch_number: index + 1,
                total_batches,
            });
            ids.push(self.enqueue(kind, run_at).await?);
        }

        info!(
            template_id = %template_id,
            recipients = buyer_ids.len(),
            batches = total_batches,
            "Queued bulk email batches"
        );
        Ok(ids)
    }

    /// Put jobs whose worker went silent past the stall timeout back in line
    pub async fn recover_stalled(&self) -> Result<u64> {
        let stale_before = self.clock.now() - self.settings.stall_timeout;
        let released = self.jobs.release_stalled(stale_before, STALLED_ERROR).await?;
        if released > 0 {
            warn!(released, "Recovered stalled jobs");
        }
        Ok(released)
    }

    /// Claim and run due jobs, at most `concurrency` at once.
    /// Returns how many jobs were run.
    pub async fn process_due(&self) -> Result<usize> {
        if let Err(e) = self.recover_stalled().await {
            warn!("Error recovering stalled jobs: {:#}", e);
        }

        let claimed = self
            .jobs
            .claim_due(self.clock.now(), self.settings.concurrency as i64)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        debug!("Processing {} due jobs", claimed.len());
        let count = claimed.len();

        let mut handles = Vec::with_capacity(count);
        for job in claimed {
            let queue = self.clone();
            handles.push(tokio::spawn(async move { queue.run_job(job).await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Job task error: {}", e);
            }
        }

        Ok(count)
    }

    async fn run_job(&self, job: Job) {
        let job_id = job.id;
        let attempt = job.attempts + 1;

        let kind: JobKind = match serde_json::from_value(job.payload.clone()) {
            Ok(kind) => kind,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Unreadable job payload");
                self.finish_failed(&job, attempt, &format!("Invalid payload: {}", e))
                    .await;
                return;
            }
        };

        // a stalled run already used up the last attempt
        if job.attempts >= job.max_attempts {
            let message = job.last_error.clone().unwrap_or_else(|| STALLED_ERROR.to_string());
            error!(job_id = %job_id, kind = kind.name(), "Job exhausted its attempts");
            self.executor.abandon(&kind, &message).await;
            self.finish_failed(&job, job.attempts, &message).await;
            self.record(kind.name(), "failed");
            return;
        }

        let ctx = JobContext::new(job_id, attempt, self.jobs.clone());
        debug!(job_id = %job_id, kind = kind.name(), attempt, "Running job");

        match self.executor.execute(&kind, &ctx).await {
            Ok(result) => {
                info!(job_id = %job_id, kind = kind.name(), "Job completed");
                if let Err(e) = self.jobs.complete(job_id, result, self.clock.now()).await {
                    error!(job_id = %job_id, error = %e, "Failed to mark job completed");
                }
                self.record(kind.name(), "completed");
                self.trim(JobStatus::Completed, self.settings.keep_completed)
                    .await;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(job_id = %job_id, kind = kind.name(), attempt, error = %message, "Job failed");

                if attempt >= job.max_attempts {
                    error!(job_id = %job_id, "Job exhausted its attempts");
                    self.finish_failed(&job, attempt, &message).await;
                    self.record(kind.name(), "failed");
                } else {
                    let run_at = self.clock.now()
                        + to_chrono(calculate_backoff(self.settings.backoff_base, attempt));
                    if let Err(e) = self.jobs.retry(job_id, attempt, &message, run_at).await {
                        error!(job_id = %job_id, error = %e, "Failed to schedule retry");
                    }
                    info!(job_id = %job_id, run_at = %run_at, "Job scheduled for retry (attempt {})", attempt + 1);
                    self.record(kind.name(), "retried");
                }
            }
        }
    }

    async fn finish_failed(&self, job: &Job, attempt: i32, message: &str) {
        if let Err(e) = self
            .jobs
            .fail(job.id, attempt, message, self.clock.now())
            .await
        {
            error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        self.trim(JobStatus::Failed, self.settings.keep_failed).await;
    }

    async fn trim(&self, status: JobStatus, keep: i64) {
        match self.jobs.trim_finished(status, keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(status = %status, removed, "Trimmed finished jobs"),
            Err(e) => warn!(status = %status, error = %e, "Failed to trim finished jobs"),
        }
    }

    fn record(&self, kind: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.job_finished(kind, outcome);
        }
    }

    /// Drop finished jobs past the retention age, then enforce the count caps
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = self
            .jobs
            .purge_finished_before(now - self.settings.retention)
            .await?;
        removed += self
            .jobs
            .trim_finished(JobStatus::Completed, self.settings.keep_completed)
            .await?;
        removed += self
            .jobs
            .trim_finished(JobStatus::Failed, self.settings.keep_failed)
            .await?;

        if removed > 0 {
            info!(removed, "Pruned finished jobs");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.jobs.stats().await?)
    }

    /// Spawn the polling worker; it stops when `shutdown` is cancelled
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.settings.poll_interval);
        let prune_every = chrono::Duration::hours(1);
        let mut last_prune: Option<DateTime<Utc>> = None;

        info!(
            "Job queue worker started (concurrency: {}, interval: {:?})",
            self.settings.concurrency, self.settings.poll_interval
        );

        if let Err(e) = self.recover_stalled().await {
            warn!("Error recovering stalled jobs: {:#}", e);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.process_due().await {
                error!("Error processing job queue: {:#}", e);
            }

            let now = self.clock.now();
            if last_prune.map_or(true, |at| now - at >= prune_every) {
                if let Err(e) = self.prune(now).await {
                    warn!("Error pruning job queue: {:#}", e);
                }
                last_prune = Some(now);
            }
        }

        info!("Job queue worker stopped");
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`
pub fn calculate_backoff(base: Duration, attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    base.saturating_mul(2u32.pow(exponent))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
