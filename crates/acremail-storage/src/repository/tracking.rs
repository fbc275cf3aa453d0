//! Email tracking event repository

use crate::db::{db_err, DatabasePool};
use crate::models::{EmailTrackingEvent, NewTrackingEvent, TrackingEventType};
use acremail_common::types::{BuyerId, CampaignId};
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Append-only tracking log
#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn record(&self, event: NewTrackingEvent) -> Result<EmailTrackingEvent>;
    /// Whether a matching event exists at or after `since`
    async fn has_event_since(
        &self,
        campaign_id: Option<CampaignId>,
        buyer_id: BuyerId,
        event_type: TrackingEventType,
        since: DateTime<Utc>,
    ) -> Result<bool>;
    /// Delete events strictly older than `cutoff`
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    /// Event counts per type within `[from, to)`
    async fn count_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<TrackingEventType, i64>>;
    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailTrackingEvent>>;
}

/// Database tracking repository
pub struct DbTrackingRepository {
    pool: DatabasePool,
}

impl DbTrackingRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackingRepository for DbTrackingRepository {
    async fn record(&self, event: NewTrackingEvent) -> Result<EmailTrackingEvent> {
        sqlx::query_as::<_, EmailTrackingEvent>(
            r#"
            INSERT INTO email_tracking (
                id, campaign_id, buyer_id, event_type, event_timestamp,
                click_url, user_agent, ip_address, provider_event_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event.campaign_id)
        .bind(event.buyer_id)
        .bind(event.event_type.to_string())
        .bind(event.event_timestamp)
        .bind(&event.click_url)
        .bind(&event.user_agent)
        .bind(&event.ip_address)
        .bind(&event.provider_event_id)
        .bind(&event.metadata)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn has_event_since(
        &self,
        campaign_id: Option<CampaignId>,
        buyer_id: BuyerId,
        event_type: TrackingEventType,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM email_tracking
                WHERE campaign_id IS NOT DISTINCT FROM $1
                  AND buyer_id = $2
                  AND event_type = $3
                  AND event_timestamp >= $4
            )
            "#,
        )
        .bind(campaign_id)
        .bind(buyer_id)
        .bind(event_type.to_string())
        .bind(since)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(exists)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM email_tracking WHERE event_timestamp < $1")
            .bind(cutoff)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn count_by_type(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<TrackingEventType, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT event_type, COUNT(*) FROM email_tracking
            WHERE event_timestamp >= $1 AND event_timestamp < $2
            GROUP BY event_type
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|(event_type, count)| {
                event_type
                    .parse::<TrackingEventType>()
                    .ok()
                    .map(|t| (t, count))
            })
            .collect())
    }

    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailTrackingEvent>> {
        sqlx::query_as::<_, EmailTrackingEvent>(
            "SELECT * FROM email_tracking WHERE campaign_id = $1 ORDER BY event_timestamp ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
