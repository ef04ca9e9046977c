use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Account;

#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tg_id: i64) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE tg_id = ?")
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account")
    }

    /// Creates or refreshes the caller record. Terms are accepted as part
    /// of signup. Returns true when the account is new.
    pub async fn upsert(&self, tg_id: i64, first_name: Option<&str>) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO accounts (tg_id, first_name, accepted_terms, created_at)
             VALUES (?, ?, 1, ?)
             ON CONFLICT (tg_id) DO NOTHING",
        )
        .bind(tg_id)
        .bind(first_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert account")?;

        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        sqlx::query("UPDATE accounts SET first_name = ?, accepted_terms = 1 WHERE tg_id = ?")
            .bind(first_name)
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to refresh account")?;
        Ok(false)
    }
}
