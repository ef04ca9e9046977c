use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One provisioned VPN identity: a client on exactly one panel, tied to
/// an owner and a paid-for expiry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entitlement {
    pub id: i64,
    pub tg_id: i64,
    pub email: String,
    pub panel: String,
    pub client_id: String,
    pub sub_id: String,
    pub expires_at: DateTime<Utc>,
    pub limit_ip: i64,
    pub enabled: bool,
    pub is_trial: bool,
    pub warned: bool,
    pub ended: bool,
    pub created_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn time_left(&self) -> chrono::Duration {
        self.expires_at - Utc::now()
    }
}

/// Insert shape for a freshly materialized entitlement.
#[derive(Debug, Clone)]
pub struct NewEntitlement {
    pub tg_id: i64,
    pub email: String,
    pub panel: String,
    pub client_id: String,
    pub sub_id: String,
    pub expires_at: DateTime<Utc>,
    pub limit_ip: i64,
    pub is_trial: bool,
}
