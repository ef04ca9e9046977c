use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::TrialGrant;

/// One-per-owner trial consumption. The claim is a guarded update, so
/// two concurrent activations can never both win.
#[derive(Debug, Clone)]
pub struct TrialRepository {
    pool: SqlitePool,
}

impl TrialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tg_id: i64) -> Result<Option<TrialGrant>> {
        sqlx::query_as::<_, TrialGrant>("SELECT * FROM trial_grants WHERE tg_id = ?")
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch trial grant")
    }

    /// Returns true when this call took the grant. False means it was
    /// already used (or a concurrent claim won).
    pub async fn claim(&self, tg_id: i64) -> Result<bool> {
        sqlx::query("INSERT INTO trial_grants (tg_id, used) VALUES (?, 0) ON CONFLICT (tg_id) DO NOTHING")
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to seed trial grant")?;

        let result = sqlx::query(
            "UPDATE trial_grants SET used = 1, used_at = ? WHERE tg_id = ? AND used = 0",
        )
        .bind(Utc::now())
        .bind(tg_id)
        .execute(&self.pool)
        .await
        .context("Failed to claim trial grant")?;

        Ok(result.rows_affected() == 1)
    }

    /// Hands the grant back after a failed materialization, so the owner
    /// can retry. Only a claim that never produced an entitlement may be
    /// released.
    pub async fn release(&self, tg_id: i64) -> Result<()> {
        sqlx::query("UPDATE trial_grants SET used = 0, used_at = NULL WHERE tg_id = ?")
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to release trial grant")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[tokio::test]
    async fn claim_wins_once() {
        let pool = init_test_db().await.unwrap();
        let repo = TrialRepository::new(pool);

        assert!(repo.claim(42).await.unwrap());
        assert!(!repo.claim(42).await.unwrap());

        let grant = repo.get(42).await.unwrap().unwrap();
        assert!(grant.used);
        assert!(grant.used_at.is_some());
    }

    #[tokio::test]
    async fn release_allows_retry() {
        let pool = init_test_db().await.unwrap();
        let repo = TrialRepository::new(pool);

        assert!(repo.claim(7).await.unwrap());
        repo.release(7).await.unwrap();
        assert!(repo.claim(7).await.unwrap());
        assert!(!repo.claim(7).await.unwrap());
    }
}
