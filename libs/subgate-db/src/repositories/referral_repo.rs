use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Referral;

#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: SqlitePool,
}

impl ReferralRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records the link. Returns false when the referee was already
    /// referred by anyone; the UNIQUE constraint is the guard.
    pub async fn record(&self, referrer_id: i64, referee_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO referrals (referrer_id, referee_id, created_at) VALUES (?, ?, ?)
             ON CONFLICT (referee_id) DO NOTHING",
        )
        .bind(referrer_id)
        .bind(referee_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to record referral")?;
        Ok(result.rows_affected() == 1)
    }

    /// Flips the bonus flag exactly once. Returns false when the bonus
    /// was already applied (or a concurrent application won).
    pub async fn mark_applied(&self, referee_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE referrals SET bonus_applied = 1, bonus_at = ?
             WHERE referee_id = ? AND bonus_applied = 0",
        )
        .bind(Utc::now())
        .bind(referee_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark referral bonus applied")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn oldest_unapplied_for(&self, referrer_id: i64) -> Result<Option<Referral>> {
        sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals
             WHERE referrer_id = ? AND bonus_applied = 0
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(referrer_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch unapplied referral")
    }

    pub async fn list_by_referrer(&self, referrer_id: i64) -> Result<Vec<Referral>> {
        sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referrer_id = ? ORDER BY created_at ASC",
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list referrals")
    }
}
