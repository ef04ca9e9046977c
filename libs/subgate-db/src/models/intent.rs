use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    New,
    Extend,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::New => "new",
            IntentKind::Extend => "extend",
        }
    }
}

impl From<&str> for IntentKind {
    fn from(s: &str) -> Self {
        match s {
            "extend" => IntentKind::Extend,
            _ => IntentKind::New,
        }
    }
}

/// An unconfirmed purchase or extension, keyed by its payment label.
/// Rows are created once and deleted once; never updated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingIntent {
    pub label: String,
    pub tg_id: i64,
    pub kind: String,
    pub days: i64,
    pub amount: i64,
    pub email: String,
    pub panel: String,
    pub created_at: DateTime<Utc>,
}

impl PendingIntent {
    pub fn intent_kind(&self) -> IntentKind {
        IntentKind::from(self.kind.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewIntent {
    pub label: String,
    pub tg_id: i64,
    pub kind: IntentKind,
    pub days: i64,
    pub amount: i64,
    pub email: String,
    pub panel: String,
}
