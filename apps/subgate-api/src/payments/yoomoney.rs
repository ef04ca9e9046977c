use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{PaymentError, PaymentGateway};

const QUICKPAY_URL: &str = "https://yoomoney.ru/quickpay/confirm.xml";
const HISTORY_URL: &str = "https://yoomoney.ru/api/operation-history";

/// YooMoney wallet gateway. Links are Quickpay form URLs; confirmation
/// scans the wallet's operation history for the label.
pub struct YooMoneyGateway {
    http: reqwest::Client,
    wallet: String,
    token: String,
    purpose: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    operations: Vec<Operation>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    label: String,
    #[serde(default)]
    status: String,
}

impl YooMoneyGateway {
    pub fn new(wallet: String, token: String, purpose: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            wallet,
            token,
            purpose,
        }
    }
}

fn has_success_for(operations: &[Operation], label: &str) -> bool {
    operations
        .iter()
        .any(|op| op.label == label && op.status == "success")
}

#[async_trait]
impl PaymentGateway for YooMoneyGateway {
    fn payment_link(&self, amount: i64, label: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("receiver", &self.wallet)
            .append_pair("quickpay-form", "shop")
            .append_pair("targets", &self.purpose)
            .append_pair("paymentType", "SB")
            .append_pair("sum", &amount.to_string())
            .append_pair("label", label)
            .finish();
        format!("{QUICKPAY_URL}?{query}")
    }

    async fn is_paid(&self, label: &str) -> Result<bool, PaymentError> {
        let resp = self
            .http
            .post(HISTORY_URL)
            .bearer_auth(&self.token)
            .form(&[("label", label), ("records", "30")])
            .send()
            .await?
            .error_for_status()?;
        let history: HistoryResponse = resp.json().await?;
        if let Some(error) = history.error {
            return Err(PaymentError::Rejected(error));
        }
        let paid = has_success_for(&history.operations, label);
        debug!(label, paid, "Payment status checked");
        Ok(paid)
    }

    fn name(&self) -> &str {
        "yoomoney"
    }
}
