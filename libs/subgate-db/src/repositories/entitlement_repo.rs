use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Entitlement, NewEntitlement};

/// Ledger of provisioned entitlements. One row per panel client we own.
#[derive(Debug, Clone)]
pub struct EntitlementRepository {
    pool: SqlitePool,
}

impl EntitlementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewEntitlement) -> Result<Entitlement> {
        sqlx::query_as::<_, Entitlement>(
            "INSERT INTO entitlements (tg_id, email, panel, client_id, sub_id, expires_at, limit_ip, enabled, is_trial, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING *",
        )
        .bind(new.tg_id)
        .bind(&new.email)
        .bind(&new.panel)
        .bind(&new.client_id)
        .bind(&new.sub_id)
        .bind(new.expires_at)
        .bind(new.limit_ip)
        .bind(new.is_trial)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert entitlement")
    }

    /// Same insert, but inside an open transaction so the caller can
    /// couple it with the payment row.
    pub async fn create_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        new: &NewEntitlement,
    ) -> Result<Entitlement> {
        sqlx::query_as::<_, Entitlement>(
            "INSERT INTO entitlements (tg_id, email, panel, client_id, sub_id, expires_at, limit_ip, enabled, is_trial, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING *",
        )
        .bind(new.tg_id)
        .bind(&new.email)
        .bind(&new.panel)
        .bind(&new.client_id)
        .bind(&new.sub_id)
        .bind(new.expires_at)
        .bind(new.limit_ip)
        .bind(new.is_trial)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert entitlement")
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Option<Entitlement>> {
        sqlx::query_as::<_, Entitlement>("SELECT * FROM entitlements WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch entitlement by email")
    }

    pub async fn get_by_owner_and_email(
        &self,
        tg_id: i64,
        email: &str,
    ) -> Result<Option<Entitlement>> {
        sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM entitlements WHERE tg_id = ? AND email = ?",
        )
        .bind(tg_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch entitlement by owner and email")
    }

    pub async fn list_by_owner(&self, tg_id: i64) -> Result<Vec<Entitlement>> {
        sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM entitlements WHERE tg_id = ? ORDER BY created_at ASC",
        )
        .bind(tg_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list entitlements for owner")
    }

    /// Paid entitlements with time left. Referral bonus targets.
    pub async fn list_active_paid_by_owner(&self, tg_id: i64) -> Result<Vec<Entitlement>> {
        sqlx::query_as::<_, Entitlement>(
            "SELECT * FROM entitlements
             WHERE tg_id = ? AND is_trial = 0 AND expires_at > ?
             ORDER BY created_at ASC",
        )
        .bind(tg_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active paid entitlements")
    }

    pub async fn all(&self) -> Result<Vec<Entitlement>> {
        sqlx::query_as::<_, Entitlement>("SELECT * FROM entitlements ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entitlements")
    }

    /// Pushes expiry forward and clears the sticky flags in one statement.
    /// Only a confirmed extension goes through here.
    pub async fn extend(&self, email: &str, new_expiry: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE entitlements SET expires_at = ?, warned = 0, ended = 0 WHERE email = ?",
        )
        .bind(new_expiry)
        .bind(email)
        .execute(&self.pool)
        .await
        .context("Failed to extend entitlement")?;
        Ok(result.rows_affected() > 0)
    }

    /// Expiry correction from panel truth. Flags stay untouched.
    pub async fn set_expiry(&self, email: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE entitlements SET expires_at = ? WHERE email = ?")
            .bind(expires_at)
            .bind(email)
            .execute(&self.pool)
            .await
            .context("Failed to set entitlement expiry")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_warned(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE entitlements SET warned = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark entitlement warned")?;
        Ok(())
    }

    pub async fn mark_ended(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE entitlements SET ended = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark entitlement ended")?;
        Ok(())
    }

}
