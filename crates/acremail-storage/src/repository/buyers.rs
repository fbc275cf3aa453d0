//! Buyer repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Buyer, ListCriteria, VIP_SOURCE};
use acremail_common::types::{normalize_email, BuyerId};
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Selection of buyers that have gone quiet
#[derive(Debug, Clone)]
pub struct InactiveBuyerQuery {
    /// Buyers with no activity since this instant
    pub inactive_since: DateTime<Utc>,
    /// Buyers never emailed, or last emailed before this instant
    pub emailed_before: DateTime<Utc>,
    pub limit: Option<i64>,
}

/// Buyer repository trait
///
/// Every query that selects an audience returns only buyers that accept
/// marketing email; lookups by id or address return the row as stored.
#[async_trait]
pub trait BuyerRepository: Send + Sync {
    async fn get(&self, id: BuyerId) -> Result<Option<Buyer>>;
    async fn get_many(&self, ids: &[BuyerId]) -> Result<Vec<Buyer>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Buyer>>;
    async fn find_matching(&self, criteria: &ListCriteria) -> Result<Vec<Buyer>>;
    async fn registered_since(&self, since: DateTime<Utc>) -> Result<Vec<Buyer>>;
    async fn find_inactive(&self, query: &InactiveBuyerQuery) -> Result<Vec<Buyer>>;
    /// Opt a buyer out; returns the number of rows changed
    async fn unsubscribe(&self, id: BuyerId, at: DateTime<Utc>) -> Result<u64>;
    async fn unsubscribe_by_email(&self, email: &str, at: DateTime<Utc>) -> Result<u64>;
    async fn stamp_last_email_sent(&self, ids: &[BuyerId], at: DateTime<Utc>) -> Result<u64>;
}

const CONSENT_FILTER: &str = "email_opt_in = TRUE AND email_status <> 'unsubscribed'";

/// Database buyer repository
pub struct DbBuyerRepository {
    pool: DatabasePool,
}

impl DbBuyerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuyerRepository for DbBuyerRepository {
    async fn get(&self, id: BuyerId) -> Result<Option<Buyer>> {
        sqlx::query_as::<_, Buyer>("SELECT * FROM buyers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn get_many(&self, ids: &[BuyerId]) -> Result<Vec<Buyer>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Buyer>("SELECT * FROM buyers WHERE id = ANY($1) ORDER BY created_at ASC")
            .bind(ids)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Buyer>> {
        sqlx::query_as::<_, Buyer>("SELECT * FROM buyers WHERE LOWER(email) = $1")
            .bind(normalize_email(email))
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find_matching(&self, criteria: &ListCriteria) -> Result<Vec<Buyer>> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT * FROM buyers
            WHERE (CARDINALITY($1::text[]) = 0 OR preferred_areas && $1::text[])
              AND (CARDINALITY($2::text[]) = 0 OR buyer_type = ANY($2::text[]))
              AND (NOT $3 OR source = $4)
              AND {}
            ORDER BY created_at ASC
            "#,
            CONSENT_FILTER
        );

        sqlx::query_as::<_, Buyer>(&sql)
            .bind(&criteria.areas)
            .bind(&criteria.buyer_types)
            .bind(criteria.is_vip)
            .bind(VIP_SOURCE)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn registered_since(&self, since: DateTime<Utc>) -> Result<Vec<Buyer>> {
        let sql = format!(
            "SELECT * FROM buyers WHERE created_at >= $1 AND {} ORDER BY created_at ASC",
            CONSENT_FILTER
        );

        sqlx::query_as::<_, Buyer>(&sql)
            .bind(since)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find_inactive(&self, query: &InactiveBuyerQuery) -> Result<Vec<Buyer>> {
        let sql = format!(
            r#"
            SELECT * FROM buyers
            WHERE updated_at < $1
              AND (last_email_sent IS NULL OR last_email_sent < $2)
              AND {}
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            CONSENT_FILTER
        );

        sqlx::query_as::<_, Buyer>(&sql)
            .bind(query.inactive_since)
            .bind(query.emailed_before)
            .bind(query.limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn unsubscribe(&self, id: BuyerId, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE buyers
            SET email_opt_in = FALSE, email_status = 'unsubscribed', updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn unsubscribe_by_email(&self, email: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE buyers
            SET email_opt_in = FALSE, email_status = 'unsubscribed', updated_at = $2
            WHERE LOWER(email) = $1
            "#,
        )
        .bind(normalize_email(email))
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn stamp_last_email_sent(&self, ids: &[BuyerId], at: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        // updated_at is the activity marker, leave it alone
        let result = sqlx::query("UPDATE buyers SET last_email_sent = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
