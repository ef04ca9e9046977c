use axum::{
    Json, Router,
    extract::{Query, State},
    response::Redirect,
    routing::{delete, get, post},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{error, info};

use crate::AppState;
use crate::error::ServiceError;
use crate::services::referral_service::ReferralOverview;
use crate::services::subscription_service::{Activation, PurchaseQuote, SubscriptionView};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth", post(auth))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/purchase", post(purchase))
        .route("/subscriptions/extend", post(extend))
        .route("/subscriptions/confirm", post(confirm))
        .route("/subscriptions/pending", delete(cancel_pending))
        .route("/subscriptions/trial", post(trial))
        .route("/referrals", get(referrals))
        .route("/referrals/claim", post(claim_referral))
}

#[derive(Deserialize)]
pub struct AuthRequest {
    #[serde(alias = "initData")]
    pub init_data: String,
    #[serde(default)]
    pub start_param: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub owner_id: i64,
    pub display_name: Option<String>,
    pub is_new: bool,
}

#[derive(Deserialize)]
pub struct OwnerQuery {
    pub owner: i64,
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub owner: i64,
    pub days: i64,
}

#[derive(Deserialize)]
pub struct ExtendRequest {
    pub owner: i64,
    pub email: String,
    pub days: i64,
}

#[derive(Deserialize)]
pub struct LabelRequest {
    pub owner: i64,
    pub label: String,
}

#[derive(Deserialize)]
pub struct TrialRequest {
    pub owner: i64,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub owner: i64,
    pub email: String,
}

#[derive(Serialize)]
pub struct SubscriptionsResponse {
    pub subscriptions: Vec<SubscriptionView>,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Deserialize)]
pub struct ImportQuery {
    pub key: String,
}

/// Signed-in Telegram WebApp user, extracted from verified initData.
#[derive(Debug)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: Option<String>,
}

async fn auth(
    State(state): State<AppState>,
    Json(payload): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, ServiceError> {
    if state.config.bot_token.is_empty() {
        return Err(anyhow::anyhow!("bot token not configured").into());
    }
    let user = verify_init_data(&payload.init_data, &state.config.bot_token)?;

    let is_new = state
        .accounts
        .upsert(user.id, user.first_name.as_deref())
        .await?;

    if is_new {
        if let Some(referrer) = parse_referral_start(payload.start_param.as_deref()) {
            info!(referrer, referee = user.id, "New account via referral link");
            if let Err(e) = state.referrals.handle_signup(referrer, user.id).await {
                error!(referrer, referee = user.id, error = ?e, "Referral signup failed");
            }
        }
    }

    Ok(Json(AuthResponse {
        owner_id: user.id,
        display_name: user.first_name,
        is_new,
    }))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<SubscriptionsResponse>, ServiceError> {
    let subscriptions = state.subscriptions.subscriptions_for(query.owner).await?;
    Ok(Json(SubscriptionsResponse { subscriptions }))
}

async fn purchase(
    State(state): State<AppState>,
    Json(payload): Json<PurchaseRequest>,
) -> Result<Json<PurchaseQuote>, ServiceError> {
    let quote = state
        .subscriptions
        .start_purchase(payload.owner, payload.days)
        .await?;
    Ok(Json(quote))
}

async fn extend(
    State(state): State<AppState>,
    Json(payload): Json<ExtendRequest>,
) -> Result<Json<PurchaseQuote>, ServiceError> {
    let quote = state
        .subscriptions
        .start_extension(payload.owner, &payload.email, payload.days)
        .await?;
    Ok(Json(quote))
}

async fn confirm(
    State(state): State<AppState>,
    Json(payload): Json<LabelRequest>,
) -> Result<Json<Activation>, ServiceError> {
    let activation = state
        .subscriptions
        .confirm(payload.owner, &payload.label)
        .await?;
    Ok(Json(activation))
}

async fn cancel_pending(
    State(state): State<AppState>,
    Json(payload): Json<LabelRequest>,
) -> Result<Json<SuccessResponse>, ServiceError> {
    state
        .subscriptions
        .cancel(payload.owner, &payload.label)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn trial(
    State(state): State<AppState>,
    Json(payload): Json<TrialRequest>,
) -> Result<Json<Activation>, ServiceError> {
    let activation = state.subscriptions.activate_trial(payload.owner).await?;
    Ok(Json(activation))
}

async fn referrals(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<ReferralOverview>, ServiceError> {
    let overview = state.referrals.overview(query.owner).await?;
    Ok(Json(overview))
}

async fn claim_referral(
    State(state): State<AppState>,
    Json(payload): Json<ClaimRequest>,
) -> Result<Json<Activation>, ServiceError> {
    let activation = state
        .referrals
        .claim_bonus(payload.owner, &payload.email)
        .await?;
    Ok(Json(activation))
}

/// Hands an access key to the VPN client app via its import deep link.
pub async fn import_redirect(Query(query): Query<ImportQuery>) -> Redirect {
    Redirect::temporary(&format!("v2raytun://import/{}", query.key))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Validates Telegram WebApp initData. The data-check-string is every
/// field except `hash`, sorted, joined with newlines; the key is
/// HMAC-SHA256("WebAppData", bot_token).
fn verify_init_data(init_data: &str, bot_token: &str) -> Result<TelegramUser, ServiceError> {
    let mut params: HashMap<String, String> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
        params.insert(key.into_owned(), value.into_owned());
    }

    let hash = params
        .remove("hash")
        .ok_or_else(|| ServiceError::Validation("initData missing hash".to_string()))?;

    let mut data_check_vec: Vec<String> =
        params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    data_check_vec.sort();
    let data_check_string = data_check_vec.join("\n");

    // Secret key = HMAC-SHA256("WebAppData", bot_token)
    let secret_key = {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"WebAppData").unwrap();
        mac.update(bot_token.as_bytes());
        mac.finalize().into_bytes()
    };

    let calculated_hash = {
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret_key).unwrap();
        mac.update(data_check_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    };

    if calculated_hash != hash {
        return Err(ServiceError::Unauthorized);
    }

    let user_json = params
        .get("user")
        .ok_or_else(|| ServiceError::Validation("initData missing user".to_string()))?;
    let user: serde_json::Value = serde_json::from_str(user_json)
        .map_err(|_| ServiceError::Validation("initData user is not JSON".to_string()))?;
    let id = user
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ServiceError::Validation("initData user has no id".to_string()))?;
    let first_name = user
        .get("first_name")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(TelegramUser { id, first_name })
}

/// "ref_42" deep-link payloads carry the referrer id.
fn parse_referral_start(start_param: Option<&str>) -> Option<i64> {
    start_param?.strip_prefix("ref_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::panel::PanelPool;
    use crate::payments::{PaymentError, PaymentGateway};
    use crate::services::notification_service::NotificationService;
    use crate::services::referral_service::ReferralService;
    use crate::services::subscription_service::SubscriptionService;
    use async_trait::async_trait;
    use axum::response::IntoResponse;
    use std::sync::Arc;
    use subgate_db::db::init_test_db;
    use subgate_db::repositories::{AccountRepository, ReferralRepository};

    const TOKEN: &str = "1234567890:TEST_TOKEN_FOR_SIGNING";

    struct StubGateway;

    #[async_trait]
    impl PaymentGateway for StubGateway {
        fn payment_link(&self, amount: i64, label: &str) -> String {
            format!("https://pay.test/?sum={amount}&label={label}")
        }

        async fn is_paid(&self, _label: &str) -> Result<bool, PaymentError> {
            Ok(false)
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    async fn test_state() -> AppState {
        let pool = init_test_db().await.unwrap();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            bot_token: TOKEN.to_string(),
            bot_username: "subgate_bot".to_string(),
            wallet: "410011111111111".to_string(),
            provider_token: String::new(),
            payment_purpose: "VPN subscription".to_string(),
            client_prefix: "EU-1".to_string(),
            panels: vec![],
            cors_origins: vec![],
            intent_ttl_hours: 24,
            warn_sweep_minutes: 180,
            purge_sweep_minutes: 1440,
            sync_sweep_minutes: 1460,
        };
        let panels = Arc::new(PanelPool::new(vec![]));
        let notifier = Arc::new(NotificationService::new(""));
        let subscriptions = Arc::new(SubscriptionService::new(
            pool.clone(),
            panels.clone(),
            Arc::new(StubGateway),
            "EU-1",
        ));
        let referrals = Arc::new(ReferralService::new(
            pool.clone(),
            subscriptions.clone(),
            notifier.clone(),
            "subgate_bot",
        ));
        AppState {
            pool: pool.clone(),
            config: Arc::new(config),
            panels,
            accounts: AccountRepository::new(pool),
            subscriptions,
            referrals,
            notifier,
        }
    }

    #[tokio::test]
    async fn auth_upserts_account_and_records_referral() {
        let state = test_state().await;
        let init_data = signed_init_data(
            &[
                ("user", r#"{"id":42,"first_name":"Ada"}"#),
                ("auth_date", "1700000000"),
            ],
            TOKEN,
        );

        let Json(response) = auth(
            State(state.clone()),
            Json(AuthRequest {
                init_data: init_data.clone(),
                start_param: Some("ref_9".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.owner_id, 42);
        assert_eq!(response.display_name.as_deref(), Some("Ada"));
        assert!(response.is_new);

        let links = ReferralRepository::new(state.pool.clone())
            .list_by_referrer(9)
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].referee_id, 42);

        // Returning user: no second referral registration.
        let Json(response) = auth(
            State(state.clone()),
            Json(AuthRequest {
                init_data,
                start_param: Some("ref_9".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(!response.is_new);
        let links = ReferralRepository::new(state.pool.clone())
            .list_by_referrer(9)
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn auth_rejects_forged_init_data() {
        let state = test_state().await;
        let forged = signed_init_data(
            &[("user", r#"{"id":42,"first_name":"Mallory"}"#)],
            "wrong:token",
        );

        let err = auth(
            State(state),
            Json(AuthRequest {
                init_data: forged,
                start_param: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn import_redirect_builds_deep_link() {
        let response = import_redirect(Query(ImportQuery {
            key: "vless://abc@host:443#EU-1-USER-42-a1b2c3".to_string(),
        }))
        .await
        .into_response();

        assert_eq!(
            response.headers()["location"],
            "v2raytun://import/vless://abc@host:443#EU-1-USER-42-a1b2c3"
        );
    }

    /// Builds initData signed the way Telegram signs it.
    fn signed_init_data(pairs: &[(&str, &str)], bot_token: &str) -> String {
        let mut data_check_vec: Vec<String> =
            pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        data_check_vec.sort();

        let secret_key = {
            let mut mac = Hmac::<Sha256>::new_from_slice(b"WebAppData").unwrap();
            mac.update(bot_token.as_bytes());
            mac.finalize().into_bytes()
        };
        let hash = {
            let mut mac = Hmac::<Sha256>::new_from_slice(&secret_key).unwrap();
            mac.update(data_check_vec.join("\n").as_bytes());
            hex::encode(mac.finalize().into_bytes())
        };

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("hash", &hash);
        serializer.finish()
    }

    #[test]
    fn valid_init_data_yields_user() {
        let init_data = signed_init_data(
            &[
                ("user", r#"{"id":42,"first_name":"Ada"}"#),
                ("auth_date", "1700000000"),
                ("query_id", "AAF3x"),
            ],
            TOKEN,
        );

        let user = verify_init_data(&init_data, TOKEN).unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.first_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn wrong_token_is_rejected() {
        let init_data = signed_init_data(
            &[
                ("user", r#"{"id":42,"first_name":"Ada"}"#),
                ("auth_date", "1700000000"),
            ],
            "other:token",
        );

        let err = verify_init_data(&init_data, TOKEN).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let init_data = signed_init_data(
            &[
                ("user", r#"{"id":42,"first_name":"Ada"}"#),
                ("auth_date", "1700000000"),
            ],
            TOKEN,
        );
        let tampered = init_data.replace("%22id%22%3A42", "%22id%22%3A43");

        let err = verify_init_data(&tampered, TOKEN).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[test]
    fn missing_hash_is_a_validation_error() {
        let err = verify_init_data("user=%7B%22id%22%3A42%7D", TOKEN).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn referral_start_param_parses() {
        assert_eq!(parse_referral_start(Some("ref_42")), Some(42));
        assert_eq!(parse_referral_start(Some("ref_abc")), None);
        assert_eq!(parse_referral_start(Some("promo")), None);
        assert_eq!(parse_referral_start(None), None);
    }
}
