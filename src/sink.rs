use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::model::Action;

/// Downstream store for generated actions.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn insert_many(&self, actions: &[Action]) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteActionSink {
    pool: SqlitePool,
}

impl SqliteActionSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActionSink for SqliteActionSink {
    #[instrument(skip_all, fields(count = actions.len()))]
    async fn insert_many(&self, actions: &[Action]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for action in actions {
            let properties = serde_json::to_string(&action.properties)?;
            let emails = action
                .contact_emails
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                "INSERT INTO actions (id, action_name, action_date, include_in_analytics, entity_type, properties, contact_emails) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(action.id.to_string())
            .bind(&action.action_name)
            .bind(action.action_date)
            .bind(action.include_in_analytics)
            .bind(action.entity_type.as_str())
            .bind(properties)
            .bind(emails)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert action {}", action.id))?;
        }
        tx.commit().await?;
        info!("actions saved");
        Ok(())
    }
}
