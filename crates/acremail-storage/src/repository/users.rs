//! Admin user repository

use crate::db::{db_err, DatabasePool};
use crate::models::AdminUser;
use acremail_common::Result;
use async_trait::async_trait;

#[async_trait]
pub trait AdminUserRepository: Send + Sync {
    async fn active_admins(&self) -> Result<Vec<AdminUser>>;
}

/// Database admin user repository
pub struct DbAdminUserRepository {
    pool: DatabasePool,
}

impl DbAdminUserRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdminUserRepository for DbAdminUserRepository {
    async fn active_admins(&self) -> Result<Vec<AdminUser>> {
        sqlx::query_as::<_, AdminUser>(
            "SELECT * FROM admin_users WHERE is_active = TRUE ORDER BY email ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
