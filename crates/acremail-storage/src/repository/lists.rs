//! Email list repository

use crate::db::{db_err, DatabasePool};
use crate::models::{Buyer, EmailList};
use acremail_common::types::ListId;
use acremail_common::Result;
use async_trait::async_trait;

#[async_trait]
pub trait EmailListRepository: Send + Sync {
    async fn get(&self, id: ListId) -> Result<Option<EmailList>>;
    /// Explicit members of a list, without consent filtering
    async fn members(&self, id: ListId) -> Result<Vec<Buyer>>;
}

/// Database email list repository
pub struct DbEmailListRepository {
    pool: DatabasePool,
}

impl DbEmailListRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmailListRepository for DbEmailListRepository {
    async fn get(&self, id: ListId) -> Result<Option<EmailList>> {
        sqlx::query_as::<_, EmailList>("SELECT * FROM email_lists WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn members(&self, id: ListId) -> Result<Vec<Buyer>> {
        sqlx::query_as::<_, Buyer>(
            r#"
            SELECT b.* FROM buyers b
            JOIN email_list_members m ON m.buyer_id = b.id
            WHERE m.list_id = $1
            ORDER BY m.created_at ASC
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
