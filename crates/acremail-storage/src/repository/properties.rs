//! Property repository

use crate::db::{db_err, DatabasePool};
use crate::models::Property;
use acremail_common::types::PropertyId;
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait PropertyRepository: Send + Sync {
    async fn get(&self, id: PropertyId) -> Result<Option<Property>>;
    /// Properties created since `since` that ask for upload notifications
    async fn auto_notify_since(&self, since: DateTime<Utc>) -> Result<Vec<Property>>;
}

/// Database property repository
pub struct DbPropertyRepository {
    pool: DatabasePool,
}

impl DbPropertyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyRepository for DbPropertyRepository {
    async fn get(&self, id: PropertyId) -> Result<Option<Property>> {
        sqlx::query_as::<_, Property>("SELECT * FROM properties WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn auto_notify_since(&self, since: DateTime<Utc>) -> Result<Vec<Property>> {
        sqlx::query_as::<_, Property>(
            r#"
            SELECT * FROM properties
            WHERE created_at >= $1 AND auto_notify_on_upload = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
