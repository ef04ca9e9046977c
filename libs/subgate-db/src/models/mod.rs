pub mod account;
pub mod entitlement;
pub mod intent;
pub mod payment;
pub mod referral;

pub use account::{Account, TrialGrant};
pub use entitlement::{Entitlement, NewEntitlement};
pub use intent::{IntentKind, NewIntent, PendingIntent};
pub use payment::{NewPayment, OperationKind, Payment};
pub use referral::Referral;
