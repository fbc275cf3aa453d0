//! Automation rule and execution repository

use crate::db::{db_err, DatabasePool};
use crate::models::{AutomationExecution, AutomationRule, NewAutomationExecution, TriggerType};
use acremail_common::types::RuleId;
use acremail_common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait AutomationRepository: Send + Sync {
    async fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>>;
    async fn active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>>;
    async fn record_execution(&self, input: NewAutomationExecution) -> Result<AutomationExecution>;
    async fn executions_for_rule(&self, rule_id: RuleId) -> Result<Vec<AutomationExecution>>;
    /// Delete `completed` executions older than `cutoff`; other statuses are kept
    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Database automation repository
pub struct DbAutomationRepository {
    pool: DatabasePool,
}

impl DbAutomationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutomationRepository for DbAutomationRepository {
    async fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn active_rules(&self, trigger: TriggerType) -> Result<Vec<AutomationRule>> {
        sqlx::query_as::<_, AutomationRule>(
            r#"
            SELECT * FROM automation_rules
            WHERE trigger_type = $1 AND is_active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(trigger.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn record_execution(&self, input: NewAutomationExecution) -> Result<AutomationExecution> {
        sqlx::query_as::<_, AutomationExecution>(
            r#"
            INSERT INTO automation_executions (
                id, rule_id, triggered_by, recipient_count, status, error_message, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.rule_id)
        .bind(&input.triggered_by)
        .bind(input.recipient_count)
        .bind(input.status.to_string())
        .bind(&input.error_message)
        .bind(input.executed_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn executions_for_rule(&self, rule_id: RuleId) -> Result<Vec<AutomationExecution>> {
        sqlx::query_as::<_, AutomationExecution>(
            "SELECT * FROM automation_executions WHERE rule_id = $1 ORDER BY executed_at ASC",
        )
        .bind(rule_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM automation_executions WHERE status = 'completed' AND executed_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
