use async_trait::async_trait;
use thiserror::Error;

pub mod yoomoney;

pub use yoomoney::YooMoneyGateway;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("payment provider rejected request: {0}")]
    Rejected(String),
}

/// External payment ledger boundary. The provider offers no webhooks;
/// confirmation is always a poll against the operation history.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Payable link for (amount, label). Pure construction, no I/O.
    fn payment_link(&self, amount: i64, label: &str) -> String;

    /// Whether a successful operation carrying this label exists.
    async fn is_paid(&self, label: &str) -> Result<bool, PaymentError>;

    fn name(&self) -> &str;
}
