use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub tg_id: i64,
    pub first_name: Option<String>,
    pub accepted_terms: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrialGrant {
    pub tg_id: i64,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}
