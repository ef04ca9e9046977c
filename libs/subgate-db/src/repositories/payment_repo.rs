use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{NewPayment, Payment};

/// Append-only payment audit. Rows are never updated or deleted.
#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, new: &NewPayment) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (tg_id, label, operation, amount, email, paid_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(new.tg_id)
        .bind(&new.label)
        .bind(new.operation.as_str())
        .bind(new.amount)
        .bind(&new.email)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to append payment")
    }

    pub async fn append_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        new: &NewPayment,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            "INSERT INTO payments (tg_id, label, operation, amount, email, paid_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(new.tg_id)
        .bind(&new.label)
        .bind(new.operation.as_str())
        .bind(new.amount)
        .bind(&new.email)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await
        .context("Failed to append payment")
    }

    pub async fn list_by_owner(&self, tg_id: i64) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE tg_id = ? ORDER BY paid_at DESC",
        )
        .bind(tg_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list payments for owner")
    }

    pub async fn count_by_label(&self, label: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE label = ?")
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count payments for label")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::models::OperationKind;

    #[tokio::test]
    async fn append_and_list() {
        let pool = init_test_db().await.unwrap();
        let repo = PaymentRepository::new(pool);

        repo.append(&NewPayment {
            tg_id: 42,
            label: "42-aaaaaa".to_string(),
            operation: OperationKind::Purchase,
            amount: 89,
            email: "EU-1-USER-42-abc123".to_string(),
        })
        .await
        .unwrap();

        let rows = repo.list_by_owner(42).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].operation, "purchase");
        assert_eq!(rows[0].amount, 89);
        assert_eq!(repo.count_by_label("42-aaaaaa").await.unwrap(), 1);
    }
}
