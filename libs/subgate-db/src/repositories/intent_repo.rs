use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{NewIntent, PendingIntent};

/// Durable store of intents awaiting payment confirmation. The atomic
/// `consume` is the serialization point for double-confirm races: only
/// one caller ever gets the row back.
#[derive(Debug, Clone)]
pub struct IntentRepository {
    pool: SqlitePool,
}

impl IntentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewIntent) -> Result<PendingIntent> {
        sqlx::query_as::<_, PendingIntent>(
            "INSERT INTO pending_intents (label, tg_id, kind, days, amount, email, panel, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&new.label)
        .bind(new.tg_id)
        .bind(new.kind.as_str())
        .bind(new.days)
        .bind(new.amount)
        .bind(&new.email)
        .bind(&new.panel)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert pending intent")
    }

    pub async fn get(&self, label: &str) -> Result<Option<PendingIntent>> {
        sqlx::query_as::<_, PendingIntent>("SELECT * FROM pending_intents WHERE label = ?")
            .bind(label)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch pending intent")
    }

    /// Deletes and returns the intent in one statement. Exactly one of
    /// any number of concurrent callers observes the row; the rest get
    /// `None`.
    pub async fn consume(&self, label: &str, tg_id: i64) -> Result<Option<PendingIntent>> {
        sqlx::query_as::<_, PendingIntent>(
            "DELETE FROM pending_intents WHERE label = ? AND tg_id = ? RETURNING *",
        )
        .bind(label)
        .bind(tg_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to consume pending intent")
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_intents WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge stale intents")?;
        Ok(result.rows_affected())
    }
}
