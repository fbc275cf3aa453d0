//! Email template repository

use crate::db::{db_err, DatabasePool};
use crate::models::EmailTemplate;
use acremail_common::types::TemplateId;
use acremail_common::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>>;
    /// First active template whose name contains `fragment`, case-insensitively
    async fn find_active_by_name(&self, fragment: &str) -> Result<Option<EmailTemplate>>;
}

/// Database template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn get(&self, id: TemplateId) -> Result<Option<EmailTemplate>> {
        sqlx::query_as::<_, EmailTemplate>("SELECT * FROM email_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find_active_by_name(&self, fragment: &str) -> Result<Option<EmailTemplate>> {
        sqlx::query_as::<_, EmailTemplate>(
            r#"
            SELECT * FROM email_templates
            WHERE is_active = TRUE AND name ILIKE '%' || $1 || '%'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(fragment)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
