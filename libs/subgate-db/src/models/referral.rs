use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// (referrer, referee) link. A referee appears in at most one link and
/// the bonus flag flips at most once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub referrer_id: i64,
    pub referee_id: i64,
    pub bonus_applied: bool,
    pub bonus_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
