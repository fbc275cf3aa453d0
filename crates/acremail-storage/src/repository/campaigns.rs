//! Campaign repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Campaign, CampaignStatus, RecipientCounts};
use acremail_common::types::CampaignId;
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Campaign repository trait.
///
/// Each method is a single-row update keyed by id; callers validate
/// lifecycle transitions before calling.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<Option<Campaign>>;
    /// Move to `queued` and stamp `sent_at`
    async fn mark_queued(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>>;
    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>>;
    async fn mark_failed(&self, id: CampaignId, error: &str) -> Result<()>;
    async fn complete(&self, id: CampaignId, counts: RecipientCounts, at: DateTime<Utc>) -> Result<()>;
    /// Scheduled campaigns whose time has come
    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;
    /// Delete a campaign and its recipient rows
    async fn delete(&self, id: CampaignId) -> Result<bool>;
}

/// Database campaign repository
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRepository for DbCampaignRepository {
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM email_campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn set_status(&self, id: CampaignId, status: CampaignStatus) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE email_campaigns
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_queued(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE email_campaigns
            SET status = 'queued', sent_at = $2, error_message = NULL, updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE email_campaigns
            SET status = 'scheduled', scheduled_at = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn mark_failed(&self, id: CampaignId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete(&self, id: CampaignId, counts: RecipientCounts, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET status = 'completed',
                completed_at = $2,
                total_sent = $3,
                total_failed = $4,
                error_message = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(counts.sent as i32)
        .bind(counts.failed as i32)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn scheduled_due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM email_campaigns
            WHERE status = 'scheduled' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn delete(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM email_campaigns WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}
