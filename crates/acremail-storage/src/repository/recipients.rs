//! Campaign recipient repository

use crate::db::{db_err, DatabasePool};
use crate::models::{CampaignRecipient, RecipientCounts};
use acremail_common::types::{BuyerId, CampaignId};
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Per-recipient rows of a campaign, unique on (campaign, buyer)
#[async_trait]
pub trait CampaignRecipientRepository: Send + Sync {
    /// Create `pending` rows for buyers that have none yet; returns rows created
    async fn ensure_pending(
        &self,
        campaign_id: CampaignId,
        buyer_ids: &[BuyerId],
        at: DateTime<Utc>,
    ) -> Result<u64>;
    /// Buyers already marked `sent` for this campaign
    async fn sent_buyer_ids(&self, campaign_id: CampaignId) -> Result<Vec<BuyerId>>;
    async fn mark_sent(&self, campaign_id: CampaignId, buyer_id: BuyerId, at: DateTime<Utc>) -> Result<()>;
    async fn mark_failed(
        &self,
        campaign_id: CampaignId,
        buyer_id: BuyerId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn list(&self, campaign_id: CampaignId) -> Result<Vec<CampaignRecipient>>;
    async fn counts(&self, campaign_id: CampaignId) -> Result<RecipientCounts>;
}

/// Database campaign recipient repository
pub struct DbCampaignRecipientRepository {
    pool: DatabasePool,
}

impl DbCampaignRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignRecipientRepository for DbCampaignRecipientRepository {
    async fn ensure_pending(
        &self,
        campaign_id: CampaignId,
        buyer_ids: &[BuyerId],
        at: DateTime<Utc>,
    ) -> Result<u64> {
        if buyer_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = buyer_ids.iter().map(|_| Uuid::now_v7()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO campaign_recipients (id, campaign_id, buyer_id, status, created_at, updated_at)
            SELECT rows.id, $3, rows.buyer_id, 'pending', $4, $4
            FROM UNNEST($1::uuid[], $2::uuid[]) AS rows(id, buyer_id)
            ON CONFLICT (campaign_id, buyer_id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(buyer_ids)
        .bind(campaign_id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn sent_buyer_ids(&self, campaign_id: CampaignId) -> Result<Vec<BuyerId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT buyer_id FROM campaign_recipients WHERE campaign_id = $1 AND status = 'sent'",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_sent(&self, campaign_id: CampaignId, buyer_id: BuyerId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_recipients
            SET status = 'sent', error_message = NULL, sent_at = $3, updated_at = $3
            WHERE campaign_id = $1 AND buyer_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(buyer_id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        campaign_id: CampaignId,
        buyer_id: BuyerId,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_recipients
            SET status = 'failed', error_message = $3, updated_at = $4
            WHERE campaign_id = $1 AND buyer_id = $2
            "#,
        )
        .bind(campaign_id)
        .bind(buyer_id)
        .bind(error)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, campaign_id: CampaignId) -> Result<Vec<CampaignRecipient>> {
        sqlx::query_as::<_, CampaignRecipient>(
            "SELECT * FROM campaign_recipients WHERE campaign_id = $1 ORDER BY created_at ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn counts(&self, campaign_id: CampaignId) -> Result<RecipientCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM campaign_recipients
            WHERE campaign_id = $1
            GROUP BY status
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let mut counts = RecipientCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "sent" => counts.sent = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}
