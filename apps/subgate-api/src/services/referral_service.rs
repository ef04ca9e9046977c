use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info};

use subgate_db::models::{NewPayment, OperationKind};
use subgate_db::repositories::{EntitlementRepository, PaymentRepository, ReferralRepository};

use crate::error::ServiceError;
use crate::services::notification_service::NotificationService;
use crate::services::subscription_service::{
    Activation, REFERRAL_BONUS_DAYS, SubscriptionService,
};

#[derive(Debug, Clone, Serialize)]
pub struct ReferralView {
    pub referee: i64,
    pub bonus_applied: bool,
    pub bonus_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralOverview {
    pub referrals: Vec<ReferralView>,
    pub share_link: String,
}

/// Referral bonuses: 7 free days per unique invited user. With no
/// active subscription the referrer gets a fresh key, with exactly one
/// it is extended in place, with several the choice is deferred until
/// the referrer picks one.
pub struct ReferralService {
    referrals: ReferralRepository,
    entitlements: EntitlementRepository,
    payments: PaymentRepository,
    subscriptions: Arc<SubscriptionService>,
    notifier: Arc<NotificationService>,
    bot_username: String,
}

impl ReferralService {
    pub fn new(
        pool: SqlitePool,
        subscriptions: Arc<SubscriptionService>,
        notifier: Arc<NotificationService>,
        bot_username: &str,
    ) -> Self {
        Self {
            referrals: ReferralRepository::new(pool.clone()),
            entitlements: EntitlementRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool),
            subscriptions,
            notifier,
            bot_username: bot_username.to_string(),
        }
    }

    /// Called once per first-seen account arriving through a referral
    /// deep link. Recording and rewarding are decoupled: a failed grant
    /// never fails the signup.
    pub async fn handle_signup(
        &self,
        referrer_id: i64,
        referee_id: i64,
    ) -> Result<(), ServiceError> {
        if referrer_id == referee_id {
            info!(referrer_id, "Self-referral ignored");
            return Ok(());
        }
        if !self.referrals.record(referrer_id, referee_id).await? {
            info!(referee_id, "Referee already referred, no bonus");
            return Ok(());
        }

        if let Err(e) = self.apply_bonus(referrer_id, referee_id).await {
            error!(referrer_id, referee_id, error = ?e, "Referral recorded but bonus failed");
        }
        Ok(())
    }

    /// Applies the oldest pending bonus to the entitlement the referrer
    /// picked. Resolution of the deferred many-subscriptions case.
    pub async fn claim_bonus(
        &self,
        referrer_id: i64,
        email: &str,
    ) -> Result<Activation, ServiceError> {
        let link = self
            .referrals
            .oldest_unapplied_for(referrer_id)
            .await?
            .ok_or(ServiceError::NotFound("pending referral bonus"))?;

        let entitlement = self
            .entitlements
            .get_by_owner_and_email(referrer_id, email)
            .await?
            .ok_or(ServiceError::NotFound("subscription"))?;
        if entitlement.is_trial {
            return Err(ServiceError::Validation(
                "trial subscriptions cannot receive a bonus".to_string(),
            ));
        }

        if !self.referrals.mark_applied(link.referee_id).await? {
            return Err(ServiceError::Conflict("bonus already applied".to_string()));
        }

        let activation = self
            .subscriptions
            .extend_entitlement(referrer_id, email, REFERRAL_BONUS_DAYS)
            .await?;
        self.record_bonus(referrer_id, link.referee_id, &activation.email)
            .await;
        Ok(activation)
    }

    pub async fn overview(&self, referrer_id: i64) -> Result<ReferralOverview, ServiceError> {
        let links = self.referrals.list_by_referrer(referrer_id).await?;
        Ok(ReferralOverview {
            referrals: links
                .into_iter()
                .map(|link| ReferralView {
                    referee: link.referee_id,
                    bonus_applied: link.bonus_applied,
                    bonus_at: link.bonus_at,
                })
                .collect(),
            share_link: self.share_link(referrer_id),
        })
    }

    pub fn share_link(&self, referrer_id: i64) -> String {
        format!("https://t.me/{}?start=ref_{}", self.bot_username, referrer_id)
    }

    /// The flag flips before the panel mutation, so a crash in between
    /// loses a bonus instead of ever granting it twice.
    async fn apply_bonus(&self, referrer_id: i64, referee_id: i64) -> Result<(), ServiceError> {
        let active = self
            .entitlements
            .list_active_paid_by_owner(referrer_id)
            .await?;

        match active.len() {
            0 => {
                if !self.referrals.mark_applied(referee_id).await? {
                    return Ok(());
                }
                let activation = self.subscriptions.grant_bonus_entitlement(referrer_id).await?;
                self.record_bonus(referrer_id, referee_id, &activation.email)
                    .await;
                self.notifier
                    .bonus_granted(referrer_id, &activation.email, activation.expires_at)
                    .await;
            }
            1 => {
                if !self.referrals.mark_applied(referee_id).await? {
                    return Ok(());
                }
                let activation = self
                    .subscriptions
                    .extend_entitlement(referrer_id, &active[0].email, REFERRAL_BONUS_DAYS)
                    .await?;
                self.record_bonus(referrer_id, referee_id, &activation.email)
                    .await;
                self.notifier
                    .bonus_granted(referrer_id, &activation.email, activation.expires_at)
                    .await;
            }
            _ => {
                // Deferred until the referrer picks a key via claim_bonus.
                let emails: Vec<String> = active.into_iter().map(|e| e.email).collect();
                self.notifier.bonus_choice_needed(referrer_id, &emails).await;
            }
        }
        Ok(())
    }

    async fn record_bonus(&self, referrer_id: i64, referee_id: i64, email: &str) {
        let row = NewPayment {
            tg_id: referrer_id,
            label: format!("REF-{referee_id}"),
            operation: OperationKind::ReferralBonus,
            amount: 0,
            email: email.to_string(),
        };
        if let Err(e) = self.payments.append(&row).await {
            error!(referrer_id, referee_id, error = ?e, "Bonus granted but audit write failed");
        }
    }
}
