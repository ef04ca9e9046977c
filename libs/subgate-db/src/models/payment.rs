use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Purchase,
    Extension,
    ReferralBonus,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Purchase => "purchase",
            OperationKind::Extension => "extension",
            OperationKind::ReferralBonus => "referral_bonus",
        }
    }
}

/// Append-only audit row for an accepted payment or granted bonus.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub tg_id: i64,
    pub label: String,
    pub operation: String,
    pub amount: i64,
    pub email: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tg_id: i64,
    pub label: String,
    pub operation: OperationKind,
    pub amount: i64,
    pub email: String,
}
