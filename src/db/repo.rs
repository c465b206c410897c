use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{instrument, warn};

use super::Pool;
use crate::model::{Account, EntityType, Session};

/// Where accounts come from and where their tokens and checkpoints go back to.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<Account>>;
    async fn save_account(&self, account: &Account) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteAccountStore {
    pool: Pool,
}

impl SqliteAccountStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn load_accounts(&self) -> Result<Vec<Account>> {
        load_accounts(&self.pool).await
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        save_account(&self.pool, account).await
    }
}

#[instrument(skip_all)]
pub async fn upsert_account(pool: &Pool, id: &str, refresh_token: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO accounts (id, refresh_token) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET refresh_token = excluded.refresh_token, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(id)
    .bind(refresh_token)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert account {id}"))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_accounts(pool: &Pool) -> Result<Vec<Account>> {
    let rows = sqlx::query(
        "SELECT id, refresh_token, access_token, expires_at FROM accounts ORDER BY created_at, id",
    )
    .fetch_all(pool)
    .await?;

    let mut checkpoints = load_checkpoints(pool).await?;
    let accounts = rows
        .into_iter()
        .map(|row| {
            let id: String = row.get("id");
            let access_token: String = row.get("access_token");
            let expires_at: Option<DateTime<Utc>> = row.get("expires_at");
            Account {
                checkpoints: checkpoints.remove(&id).unwrap_or_default(),
                refresh_token: row.get("refresh_token"),
                session: Session::new(access_token, expires_at),
                id,
            }
        })
        .collect();
    Ok(accounts)
}

async fn load_checkpoints(
    pool: &Pool,
) -> Result<HashMap<String, HashMap<EntityType, DateTime<Utc>>>> {
    let rows = sqlx::query("SELECT account_id, entity_type, last_pulled_at FROM checkpoints")
        .fetch_all(pool)
        .await?;
    let mut out: HashMap<String, HashMap<EntityType, DateTime<Utc>>> = HashMap::new();
    for row in rows {
        let account_id: String = row.get("account_id");
        let entity: String = row.get("entity_type");
        let Some(entity) = EntityType::parse(&entity) else {
            warn!(%account_id, %entity, "ignoring checkpoint for unknown entity type");
            continue;
        };
        out.entry(account_id)
            .or_default()
            .insert(entity, row.get("last_pulled_at"));
    }
    Ok(out)
}

/// Writes the account's current token and every checkpoint in one transaction.
#[instrument(skip_all, fields(account = %account.id))]
pub async fn save_account(pool: &Pool, account: &Account) -> Result<()> {
    let credentials = account.session.snapshot().await;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE accounts SET access_token = ?, expires_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(&credentials.access_token)
    .bind(credentials.expires_at)
    .bind(&account.id)
    .execute(&mut *tx)
    .await?;

    for (entity, at) in &account.checkpoints {
        sqlx::query(
            "INSERT INTO checkpoints (account_id, entity_type, last_pulled_at) VALUES (?, ?, ?) ON CONFLICT(account_id, entity_type) DO UPDATE SET last_pulled_at = excluded.last_pulled_at",
        )
        .bind(&account.id)
        .bind(entity.as_str())
        .bind(*at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_actions(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actions")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
