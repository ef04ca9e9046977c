use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, warn};
use uuid::Uuid;

use subgate_db::models::{
    IntentKind, NewEntitlement, NewIntent, NewPayment, OperationKind, PendingIntent,
};
use subgate_db::repositories::{
    EntitlementRepository, IntentRepository, PaymentRepository, TrialRepository,
};

use crate::error::ServiceError;
use crate::panel::{Panel, PanelClient, PanelError, PanelPool};
use crate::payments::PaymentGateway;

pub const FLOW: &str = "xtls-rprx-vision";
pub const PAID_DEVICE_LIMIT: i64 = 5;
pub const TRIAL_DEVICE_LIMIT: i64 = 1;
pub const TRIAL_DAYS: i64 = 3;
pub const REFERRAL_BONUS_DAYS: i64 = 7;

const SUB_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Price in rubles for a subscription period. `None` for periods we do
/// not sell.
pub fn price_for(days: i64) -> Option<i64> {
    match days {
        30 => Some(89),
        90 => Some(249),
        180 => Some(449),
        360 => Some(849),
        _ => None,
    }
}

/// Extension arithmetic: remaining time is never lost, expired keys
/// restart from now.
pub fn extended_expiry(
    now: DateTime<Utc>,
    current: Option<DateTime<Utc>>,
    days: i64,
) -> DateTime<Utc> {
    let base = match current {
        Some(t) if t > now => t,
        _ => now,
    };
    base + Duration::days(days)
}

/// An offer awaiting payment: the user follows `payment_link`, then
/// confirms with `label`.
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseQuote {
    pub payment_link: String,
    pub label: String,
    pub email: String,
    pub amount: i64,
}

/// A provisioned (or re-provisioned) key the user can import right away.
#[derive(Debug, Clone, Serialize)]
pub struct Activation {
    pub email: String,
    pub access_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub email: String,
    pub panel: String,
    pub expires_at: DateTime<Utc>,
    pub is_trial: bool,
    pub is_expired: bool,
    /// `None` when the panel was removed from configuration.
    pub access_key: Option<String>,
}

/// Purchase, extension, trial and confirmation flows. Every confirmed
/// payment goes through the single-shot intent consume, so a client on
/// a panel is created at most once per payment no matter how often the
/// user mashes the confirm button.
pub struct SubscriptionService {
    pool: SqlitePool,
    entitlements: EntitlementRepository,
    intents: IntentRepository,
    payments: PaymentRepository,
    trials: TrialRepository,
    panels: Arc<PanelPool>,
    gateway: Arc<dyn PaymentGateway>,
    prefix: String,
}

impl SubscriptionService {
    pub fn new(
        pool: SqlitePool,
        panels: Arc<PanelPool>,
        gateway: Arc<dyn PaymentGateway>,
        prefix: &str,
    ) -> Self {
        let entitlements = EntitlementRepository::new(pool.clone());
        let intents = IntentRepository::new(pool.clone());
        let payments = PaymentRepository::new(pool.clone());
        let trials = TrialRepository::new(pool.clone());
        Self {
            pool,
            entitlements,
            intents,
            payments,
            trials,
            panels,
            gateway,
            prefix: prefix.to_string(),
        }
    }

    /// Starts a purchase: picks the least-loaded panel, records a pending
    /// intent and returns the payment link. Nothing is provisioned yet.
    pub async fn start_purchase(
        &self,
        tg_id: i64,
        days: i64,
    ) -> Result<PurchaseQuote, ServiceError> {
        let amount = price_for(days).ok_or(ServiceError::InvalidPeriod(days))?;
        let panel = self
            .panels
            .select_best()
            .await
            .ok_or(ServiceError::NoPanelAvailable)?;

        let email = self.new_user_email(tg_id);
        let label = new_label(tg_id);
        self.intents
            .create(&NewIntent {
                label: label.clone(),
                tg_id,
                kind: IntentKind::New,
                days,
                amount,
                email: email.clone(),
                panel: panel.name.clone(),
            })
            .await?;

        let payment_link = self.gateway.payment_link(amount, &label);
        Ok(PurchaseQuote {
            payment_link,
            label,
            email,
            amount,
        })
    }

    /// Starts an extension of an existing paid key. The intent targets
    /// the panel the key already lives on.
    pub async fn start_extension(
        &self,
        tg_id: i64,
        email: &str,
        days: i64,
    ) -> Result<PurchaseQuote, ServiceError> {
        let amount = price_for(days).ok_or(ServiceError::InvalidPeriod(days))?;
        let entitlement = self
            .entitlements
            .get_by_owner_and_email(tg_id, email)
            .await?
            .ok_or(ServiceError::NotFound("subscription"))?;
        if entitlement.is_trial {
            return Err(ServiceError::Validation(
                "trial subscriptions cannot be extended".to_string(),
            ));
        }

        let label = new_extend_label(tg_id);
        self.intents
            .create(&NewIntent {
                label: label.clone(),
                tg_id,
                kind: IntentKind::Extend,
                days,
                amount,
                email: entitlement.email.clone(),
                panel: entitlement.panel.clone(),
            })
            .await?;

        let payment_link = self.gateway.payment_link(amount, &label);
        Ok(PurchaseQuote {
            payment_link,
            label,
            email: entitlement.email,
            amount,
        })
    }

    /// Confirms a payment. Checks the provider first; only a paid label
    /// consumes the intent, and only the consumer materializes. Once the
    /// intent is gone, every later confirm is a plain not-found; the
    /// caller re-reads the ledger to see what happened.
    pub async fn confirm(&self, tg_id: i64, label: &str) -> Result<Activation, ServiceError> {
        match self.intents.get(label).await? {
            Some(intent) if intent.tg_id == tg_id => {}
            _ => return Err(ServiceError::NotFound("pending payment")),
        }

        if !self.gateway.is_paid(label).await? {
            // Intent stays; the user can retry after paying.
            return Err(ServiceError::PaymentNotConfirmed);
        }

        // The loser of a concurrent confirm race lands here too.
        let Some(intent) = self.intents.consume(label, tg_id).await? else {
            return Err(ServiceError::NotFound("pending payment"));
        };

        match intent.intent_kind() {
            IntentKind::New => self.materialize_new(intent).await,
            IntentKind::Extend => self.materialize_extension(intent).await,
        }
    }

    /// Discards a pending intent the user changed their mind about.
    pub async fn cancel(&self, tg_id: i64, label: &str) -> Result<(), ServiceError> {
        match self.intents.consume(label, tg_id).await? {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound("pending payment")),
        }
    }

    /// One-time trial key: 3 days, single device. The grant is claimed
    /// before provisioning and released again if the panel call fails.
    pub async fn activate_trial(&self, tg_id: i64) -> Result<Activation, ServiceError> {
        if !self.trials.claim(tg_id).await? {
            return Err(ServiceError::Conflict("trial already used".to_string()));
        }

        let Some(panel) = self.panels.select_best().await else {
            self.release_trial(tg_id).await;
            return Err(ServiceError::NoPanelAvailable);
        };

        let email = self.new_trial_email(tg_id);
        let expires_at = Utc::now() + Duration::days(TRIAL_DAYS);
        let client = new_client(&email, tg_id, expires_at, TRIAL_DEVICE_LIMIT);
        if let Err(e) = panel.api().add_client(&client).await {
            self.release_trial(tg_id).await;
            return Err(e.into());
        }

        if let Err(e) = self
            .entitlements
            .create(&new_entitlement(&panel.name, &client, true))
            .await
        {
            error!(email = %email, error = ?e, "Trial client created but ledger write failed");
        }

        Ok(Activation {
            access_key: panel.access_key(&client.id, &client.email, &client.sub_id),
            email,
            expires_at,
        })
    }

    /// Everything the owner holds, newest last, with ready-to-import keys.
    pub async fn subscriptions_for(
        &self,
        tg_id: i64,
    ) -> Result<Vec<SubscriptionView>, ServiceError> {
        let rows = self.entitlements.list_by_owner(tg_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| SubscriptionView {
                access_key: self
                    .panels
                    .by_name(&row.panel)
                    .map(|p| p.access_key(&row.client_id, &row.email, &row.sub_id)),
                is_expired: row.is_expired(),
                email: row.email,
                panel: row.panel,
                expires_at: row.expires_at,
                is_trial: row.is_trial,
            })
            .collect())
    }

    /// Provisions a fresh 7-day paid key without charging. Referral
    /// bonus path for owners with no active subscription.
    pub async fn grant_bonus_entitlement(&self, tg_id: i64) -> Result<Activation, ServiceError> {
        let panel = self
            .panels
            .select_best()
            .await
            .ok_or(ServiceError::NoPanelAvailable)?;

        let email = self.new_user_email(tg_id);
        let expires_at = Utc::now() + Duration::days(REFERRAL_BONUS_DAYS);
        let client = new_client(&email, tg_id, expires_at, PAID_DEVICE_LIMIT);
        panel.api().add_client(&client).await?;

        if let Err(e) = self
            .entitlements
            .create(&new_entitlement(&panel.name, &client, false))
            .await
        {
            error!(email = %email, error = ?e, "Bonus client created but ledger write failed");
        }

        Ok(Activation {
            access_key: panel.access_key(&client.id, &client.email, &client.sub_id),
            email,
            expires_at,
        })
    }

    /// Pushes an existing paid key forward without charging. Referral
    /// bonus path for owners with an active subscription.
    pub async fn extend_entitlement(
        &self,
        tg_id: i64,
        email: &str,
        days: i64,
    ) -> Result<Activation, ServiceError> {
        let entitlement = self
            .entitlements
            .get_by_owner_and_email(tg_id, email)
            .await?
            .ok_or(ServiceError::NotFound("subscription"))?;
        if entitlement.is_trial {
            return Err(ServiceError::Validation(
                "trial subscriptions cannot be extended".to_string(),
            ));
        }
        let panel = self
            .panels
            .by_name(&entitlement.panel)
            .ok_or(ServiceError::NoPanelAvailable)?;

        let activation = self
            .extend_on_panel(panel, &entitlement.email, tg_id, days)
            .await?;
        self.record_extension(&entitlement.email, activation.expires_at)
            .await;
        Ok(activation)
    }

    async fn materialize_new(&self, intent: PendingIntent) -> Result<Activation, ServiceError> {
        let panel = match self.panels.by_name(&intent.panel) {
            Some(p) => p,
            // Panel dropped from config since the intent was created.
            None => match self.panels.select_best().await {
                Some(p) => {
                    warn!(panel = %intent.panel, fallback = %p.name, "Intent panel gone, using fallback");
                    p
                }
                None => {
                    self.restore_intent(&intent).await;
                    return Err(ServiceError::NoPanelAvailable);
                }
            },
        };

        let expires_at = Utc::now() + Duration::days(intent.days);
        let client = new_client(&intent.email, intent.tg_id, expires_at, PAID_DEVICE_LIMIT);
        if let Err(e) = panel.api().add_client(&client).await {
            self.restore_intent(&intent).await;
            return Err(e.into());
        }

        if let Err(e) = self.record_purchase(&intent, &client, panel).await {
            error!(email = %intent.email, error = ?e, "Panel client created but ledger write failed; sync will adopt it");
        }

        Ok(Activation {
            access_key: panel.access_key(&client.id, &client.email, &client.sub_id),
            email: intent.email,
            expires_at,
        })
    }

    async fn materialize_extension(
        &self,
        intent: PendingIntent,
    ) -> Result<Activation, ServiceError> {
        let Some(panel) = self.panels.by_name(&intent.panel) else {
            self.restore_intent(&intent).await;
            return Err(ServiceError::NoPanelAvailable);
        };

        match self
            .extend_on_panel(panel, &intent.email, intent.tg_id, intent.days)
            .await
        {
            Ok(activation) => {
                self.record_extension(&intent.email, activation.expires_at)
                    .await;
                if let Err(e) = self
                    .payments
                    .append(&NewPayment {
                        tg_id: intent.tg_id,
                        label: intent.label.clone(),
                        operation: OperationKind::Extension,
                        amount: intent.amount,
                        email: intent.email.clone(),
                    })
                    .await
                {
                    error!(label = %intent.label, error = ?e, "Extension applied but payment audit write failed");
                }
                Ok(activation)
            }
            // The paid-for client no longer exists; nothing to retry.
            Err(PanelError::ClientNotFound) => Err(ServiceError::NotFound("subscription")),
            Err(e) => {
                self.restore_intent(&intent).await;
                Err(e.into())
            }
        }
    }

    /// Extension against panel truth: the panel's own expiry is the
    /// base, not the ledger's cached copy.
    async fn extend_on_panel(
        &self,
        panel: &Panel,
        email: &str,
        tg_id: i64,
        days: i64,
    ) -> Result<Activation, PanelError> {
        let mut client = panel.api().find_client(email).await?;
        let new_expiry = extended_expiry(Utc::now(), client.expires_at(), days);

        client.expiry_time = new_expiry.timestamp_millis();
        client.enable = true;
        client.flow = FLOW.to_string();
        if client.tg_id == 0 {
            client.tg_id = tg_id;
        }
        if client.limit_ip <= 0 {
            client.limit_ip = PAID_DEVICE_LIMIT;
        }
        panel.api().update_client(&client).await?;

        Ok(Activation {
            access_key: panel.access_key(&client.id, &client.email, &client.sub_id),
            email: email.to_string(),
            expires_at: new_expiry,
        })
    }

    /// Entitlement and payment row in one transaction.
    async fn record_purchase(
        &self,
        intent: &PendingIntent,
        client: &PanelClient,
        panel: &Panel,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open ledger transaction")?;
        self.entitlements
            .create_tx(&mut tx, &new_entitlement(&panel.name, client, false))
            .await?;
        self.payments
            .append_tx(
                &mut tx,
                &NewPayment {
                    tg_id: intent.tg_id,
                    label: intent.label.clone(),
                    operation: OperationKind::Purchase,
                    amount: intent.amount,
                    email: intent.email.clone(),
                },
            )
            .await?;
        tx.commit()
            .await
            .context("Failed to commit ledger transaction")
    }

    /// Ledger-side expiry push. The panel mutation already succeeded, so
    /// failures here are logged, not surfaced.
    async fn record_extension(&self, email: &str, expires_at: DateTime<Utc>) {
        match self.entitlements.extend(email, expires_at).await {
            Ok(true) => {}
            Ok(false) => warn!(email, "Extended a client the ledger does not know; sync will adopt it"),
            Err(e) => error!(email, error = ?e, "Extension applied but ledger write failed"),
        }
    }

    /// Puts a consumed intent back after a failed panel mutation so the
    /// user can retry the confirm.
    async fn restore_intent(&self, intent: &PendingIntent) {
        let restored = NewIntent {
            label: intent.label.clone(),
            tg_id: intent.tg_id,
            kind: intent.intent_kind(),
            days: intent.days,
            amount: intent.amount,
            email: intent.email.clone(),
            panel: intent.panel.clone(),
        };
        if let Err(e) = self.intents.create(&restored).await {
            error!(label = %intent.label, error = ?e, "Failed to restore intent after panel failure");
        }
    }

    async fn release_trial(&self, tg_id: i64) {
        if let Err(e) = self.trials.release(tg_id).await {
            error!(tg_id, error = ?e, "Failed to release trial grant");
        }
    }

    fn new_user_email(&self, tg_id: i64) -> String {
        format!("{}-USER-{}-{}", self.prefix, tg_id, hex6())
    }

    fn new_trial_email(&self, tg_id: i64) -> String {
        format!("{}-TRIAL-{}-{}", self.prefix, tg_id, hex6())
    }
}

fn new_entitlement(panel: &str, client: &PanelClient, is_trial: bool) -> NewEntitlement {
    NewEntitlement {
        tg_id: client.tg_id,
        email: client.email.clone(),
        panel: panel.to_string(),
        client_id: client.id.clone(),
        sub_id: client.sub_id.clone(),
        expires_at: client.expires_at().unwrap_or_else(Utc::now),
        limit_ip: client.limit_ip,
        is_trial,
    }
}

fn new_client(email: &str, tg_id: i64, expires_at: DateTime<Utc>, limit_ip: i64) -> PanelClient {
    PanelClient {
        id: Uuid::new_v4().to_string(),
        email: email.to_string(),
        enable: true,
        expiry_time: expires_at.timestamp_millis(),
        flow: FLOW.to_string(),
        limit_ip,
        sub_id: new_sub_id(),
        tg_id,
        total_gb: 0,
    }
}

fn hex6() -> String {
    Uuid::new_v4().simple().to_string().chars().take(6).collect()
}

fn new_label(tg_id: i64) -> String {
    format!("{}-{}", tg_id, hex6())
}

fn new_extend_label(tg_id: i64) -> String {
    format!("EXTEND-{}-{}", tg_id, hex6())
}

fn new_sub_id() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| SUB_ID_ALPHABET[rng.random_range(0..SUB_ID_ALPHABET.len())] as char)
        .collect()
}
