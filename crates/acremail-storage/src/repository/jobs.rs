//! Job queue persistence

use crate::db::{db_err, DatabasePool};
use crate::models::{Job, JobStatus, NewJob, QueueStats};
use acremail_common::types::JobId;
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable job storage. Claiming is atomic: a job is handed to one worker only.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job>;
    async fn get(&self, id: JobId) -> Result<Option<Job>>;
    /// Move up to `limit` due pending jobs to `processing`, oldest first
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;
    /// Return `processing` jobs started before `stale_before` to `pending`,
    /// counting the lost run as an attempt
    async fn release_stalled(&self, stale_before: DateTime<Utc>, error: &str) -> Result<u64>;
    async fn update_progress(&self, id: JobId, progress: i32) -> Result<()>;
    async fn complete(&self, id: JobId, result: serde_json::Value, at: DateTime<Utc>) -> Result<()>;
    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()>;
    async fn retry(&self, id: JobId, attempts: i32, error: &str, run_at: DateTime<Utc>) -> Result<()>;
    /// Keep only the `keep` most recently finished jobs with `status`
    async fn trim_finished(&self, status: JobStatus, keep: i64) -> Result<u64>;
    /// Delete completed and failed jobs finished before `cutoff`
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn stats(&self) -> Result<QueueStats>;
}

/// Database job repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, queue, payload, status, attempts, max_attempts, progress, scheduled_at, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, 0, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = $1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = 'pending' AND scheduled_at <= $1
                ORDER BY scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn release_stalled(&self, stale_before: DateTime<Utc>, error: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = attempts + 1, last_error = $2, started_at = NULL
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(stale_before)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn update_progress(&self, id: JobId, progress: i32) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1")
            .bind(id)
            .bind(progress)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn complete(&self, id: JobId, result: serde_json::Value, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result = $2, progress = 100, completed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', attempts = $2, last_error = $3, completed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn retry(&self, id: JobId, attempts: i32, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = $2, last_error = $3, scheduled_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(run_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn trim_finished(&self, status: JobStatus, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status = $1
                ORDER BY completed_at DESC NULLS LAST
                OFFSET $2
            )
            "#,
        )
        .bind(status.to_string())
        .bind(keep)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(self.pool.pool())
                .await
                .map_err(db_err)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}
