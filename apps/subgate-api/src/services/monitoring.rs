use chrono::{DateTime, Duration, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};

use subgate_db::models::{Entitlement, NewEntitlement};
use subgate_db::repositories::{EntitlementRepository, IntentRepository};

use crate::AppState;
use crate::panel::{Panel, PanelClient};

const PURGE_GRACE_DAYS: i64 = 7;
const WARN_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmailKind {
    User,
    Trial,
}

/// Background sweeps: expiry warnings, stale-intent cleanup, panel
/// garbage collection and ledger reconciliation. Each sweep is
/// independent; one failing never stops the others.
pub struct MonitoringService {
    state: AppState,
    entitlements: EntitlementRepository,
    intents: IntentRepository,
}

impl MonitoringService {
    pub fn new(state: AppState) -> Self {
        let entitlements = EntitlementRepository::new(state.pool.clone());
        let intents = IntentRepository::new(state.pool.clone());
        Self {
            state,
            entitlements,
            intents,
        }
    }

    pub async fn start(&self) {
        info!("Starting background monitoring service...");
        let mut interval = interval(tokio::time::Duration::from_secs(60));
        let mut minute_counter: u64 = 0;

        loop {
            interval.tick().await;
            minute_counter += 1;

            if minute_counter % self.state.config.warn_sweep_minutes == 0 {
                if let Err(e) = self.check_expirations().await {
                    error!("Monitoring error (expirations): {}", e);
                }
            }

            if minute_counter % 60 == 0 {
                if let Err(e) = self.purge_stale_intents().await {
                    error!("Monitoring error (stale intents): {}", e);
                }
            }

            if minute_counter % self.state.config.purge_sweep_minutes == 0 {
                if let Err(e) = self.purge_stale_clients().await {
                    error!("Monitoring error (client purge): {}", e);
                }
            }

            if minute_counter % self.state.config.sync_sweep_minutes == 0 {
                if let Err(e) = self.sync_ledger().await {
                    error!("Monitoring error (ledger sync): {}", e);
                }
            }
        }
    }

    /// One reconciliation pass, for the `sync` CLI command.
    pub async fn run_sync_once(&self) -> anyhow::Result<()> {
        self.sync_ledger().await
    }

    /// Warns owners 24h ahead and flags rows that ran out. Both flags
    /// are sticky, so each notification fires at most once per row.
    pub async fn check_expirations(&self) -> anyhow::Result<()> {
        let rows = self.entitlements.all().await?;
        for row in rows {
            if let Err(e) = self.check_one_expiration(&row).await {
                error!(email = %row.email, error = ?e, "Expiration check failed");
            }
        }
        Ok(())
    }

    async fn check_one_expiration(&self, row: &Entitlement) -> anyhow::Result<()> {
        let left = row.time_left();
        if left <= Duration::zero() {
            if !row.ended {
                self.entitlements.mark_ended(row.id).await?;
                self.state.notifier.expired_notice(row.tg_id, &row.email).await;
            }
        } else if left <= Duration::hours(WARN_WINDOW_HOURS) && !row.warned {
            self.entitlements.mark_warned(row.id).await?;
            self.state
                .notifier
                .expiry_warning(row.tg_id, &row.email, row.expires_at)
                .await;
        }
        Ok(())
    }

    /// Drops intents whose payment window ran out. An intent past the
    /// TTL can no longer be confirmed.
    pub async fn purge_stale_intents(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - Duration::hours(self.state.config.intent_ttl_hours);
        let purged = self.intents.purge_older_than(cutoff).await?;
        if purged > 0 {
            info!(purged, "Dropped expired payment intents");
        }
        Ok(())
    }

    /// Removes long-expired clients from every panel: paid keys after a
    /// 7-day grace, trial keys immediately. Clients without our email
    /// tags belong to someone else and are never touched.
    pub async fn purge_stale_clients(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        for panel in self.state.panels.iter() {
            let clients = match panel.api().list_clients().await {
                Ok(clients) => clients,
                Err(e) => {
                    warn!(panel = %panel.name, error = %e, "Purge skipped, panel unreachable");
                    continue;
                }
            };

            let mut deleted = 0u64;
            for client in clients {
                let Some(kind) = classify_email(&client.email, &self.state.config.client_prefix)
                else {
                    continue;
                };
                let Some(expires_at) = client.expires_at() else {
                    continue;
                };
                if !should_purge(kind, expires_at, now) {
                    continue;
                }

                match panel.api().delete_client(&client.email).await {
                    Ok(n) => {
                        deleted += n;
                        info!(panel = %panel.name, email = %client.email, "Purged expired client");
                    }
                    Err(e) => warn!(email = %client.email, error = %e, "Failed to purge client"),
                }
            }
            if deleted > 0 {
                info!(panel = %panel.name, deleted, "Panel purge finished");
            }
        }
        Ok(())
    }

    /// Re-aligns the ledger with panel truth: corrects drifted expiry
    /// dates and adopts paid clients the ledger has never seen.
    pub async fn sync_ledger(&self) -> anyhow::Result<()> {
        for panel in self.state.panels.iter() {
            let clients = match panel.api().list_clients().await {
                Ok(clients) => clients,
                Err(e) => {
                    warn!(panel = %panel.name, error = %e, "Sync skipped, panel unreachable");
                    continue;
                }
            };

            for client in clients {
                if classify_email(&client.email, &self.state.config.client_prefix)
                    != Some(EmailKind::User)
                {
                    continue;
                }
                let Some(panel_expiry) = client.expires_at() else {
                    continue;
                };
                if let Err(e) = self.sync_one_client(panel, &client, panel_expiry).await {
                    error!(email = %client.email, error = ?e, "Ledger sync failed for client");
                }
            }
        }
        Ok(())
    }

    async fn sync_one_client(
        &self,
        panel: &Panel,
        client: &PanelClient,
        panel_expiry: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match self.entitlements.get_by_email(&client.email).await? {
            Some(row) => {
                let drift = (panel_expiry - row.expires_at).num_seconds().abs();
                if drift > 60 {
                    self.entitlements.set_expiry(&client.email, panel_expiry).await?;
                    info!(email = %client.email, drift, "Corrected ledger expiry from panel");
                }
            }
            None => {
                let owner = if client.tg_id != 0 {
                    Some(client.tg_id)
                } else {
                    owner_from_email(&client.email)
                };
                let Some(tg_id) = owner else {
                    warn!(email = %client.email, "Unledgered client with no readable owner");
                    return Ok(());
                };
                self.entitlements
                    .create(&NewEntitlement {
                        tg_id,
                        email: client.email.clone(),
                        panel: panel.name.clone(),
                        client_id: client.id.clone(),
                        sub_id: client.sub_id.clone(),
                        expires_at: panel_expiry,
                        limit_ip: client.limit_ip,
                        is_trial: false,
                    })
                    .await?;
                info!(email = %client.email, tg_id, "Adopted unledgered client");
            }
        }
        Ok(())
    }
}

fn classify_email(email: &str, prefix: &str) -> Option<EmailKind> {
    if email.starts_with(&format!("{prefix}-USER-")) {
        Some(EmailKind::User)
    } else if email.starts_with(&format!("{prefix}-TRIAL-")) {
        Some(EmailKind::Trial)
    } else {
        None
    }
}

/// Owner id from a "{prefix}-USER-{tg_id}-{suffix}" email. The prefix
/// may itself contain dashes, so parse from the right.
fn owner_from_email(email: &str) -> Option<i64> {
    let mut parts = email.rsplitn(3, '-');
    let _suffix = parts.next()?;
    parts.next()?.parse().ok()
}

fn should_purge(kind: EmailKind, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match kind {
        EmailKind::User => expires_at + Duration::days(PURGE_GRACE_DAYS) < now,
        EmailKind::Trial => expires_at < now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::panel::{Panel, PanelError, PanelPool, ProvisioningApi};
    use crate::payments::{PaymentError, PaymentGateway};
    use crate::services::notification_service::NotificationService;
    use crate::services::referral_service::ReferralService;
    use crate::services::subscription_service::SubscriptionService;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use subgate_db::db::init_test_db;
    use subgate_db::repositories::AccountRepository;
    use uuid::Uuid;

    #[derive(Default)]
    struct StubPanel {
        clients: Mutex<Vec<PanelClient>>,
    }

    #[async_trait]
    impl ProvisioningApi for StubPanel {
        async fn client_count(&self) -> Result<u64, PanelError> {
            Ok(self.clients.lock().unwrap().len() as u64)
        }

        async fn list_clients(&self) -> Result<Vec<PanelClient>, PanelError> {
            Ok(self.clients.lock().unwrap().clone())
        }

        async fn add_client(&self, client: &PanelClient) -> Result<(), PanelError> {
            self.clients.lock().unwrap().push(client.clone());
            Ok(())
        }

        async fn find_client(&self, email: &str) -> Result<PanelClient, PanelError> {
            self.clients
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.email == email)
                .cloned()
                .ok_or(PanelError::ClientNotFound)
        }

        async fn update_client(&self, client: &PanelClient) -> Result<(), PanelError> {
            let mut clients = self.clients.lock().unwrap();
            match clients.iter_mut().find(|c| c.id == client.id) {
                Some(slot) => {
                    *slot = client.clone();
                    Ok(())
                }
                None => Err(PanelError::ClientNotFound),
            }
        }

        async fn delete_client(&self, email: &str) -> Result<u64, PanelError> {
            let mut clients = self.clients.lock().unwrap();
            let before = clients.len();
            clients.retain(|c| c.email != email);
            Ok((before - clients.len()) as u64)
        }
    }

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

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            bot_token: String::new(),
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
        }
    }

    async fn state_with_panel(api: Arc<StubPanel>) -> AppState {
        let pool = init_test_db().await.unwrap();
        let panels = Arc::new(PanelPool::new(vec![Panel::with_api(
            "alpha",
            "vless://{client_id}@alpha.example.org:443#{email}",
            api,
        )]));
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
            config: Arc::new(test_config()),
            panels,
            accounts: AccountRepository::new(pool),
            subscriptions,
            referrals,
            notifier,
        }
    }

    fn panel_client(email: &str, tg_id: i64, expires_at: DateTime<Utc>) -> PanelClient {
        PanelClient {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            enable: true,
            expiry_time: expires_at.timestamp_millis(),
            flow: "xtls-rprx-vision".to_string(),
            limit_ip: 5,
            sub_id: "abcdef0123456789".to_string(),
            tg_id,
            total_gb: 0,
        }
    }

    async fn seed_row(
        state: &AppState,
        email: &str,
        tg_id: i64,
        expires_at: DateTime<Utc>,
        is_trial: bool,
    ) -> Entitlement {
        EntitlementRepository::new(state.pool.clone())
            .create(&NewEntitlement {
                tg_id,
                email: email.to_string(),
                panel: "alpha".to_string(),
                client_id: Uuid::new_v4().to_string(),
                sub_id: "abcdef0123456789".to_string(),
                expires_at,
                limit_ip: if is_trial { 1 } else { 5 },
                is_trial,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn expiration_sweep_sets_sticky_flags() {
        let api = Arc::new(StubPanel::default());
        let state = state_with_panel(api).await;
        let now = Utc::now();

        let soon = seed_row(&state, "EU-1-USER-1-soon01", 1, now + Duration::hours(10), false).await;
        let gone = seed_row(&state, "EU-1-USER-2-gone01", 2, now - Duration::hours(1), false).await;
        let fresh =
            seed_row(&state, "EU-1-USER-3-fresh1", 3, now + Duration::days(20), false).await;

        let service = MonitoringService::new(state.clone());
        service.check_expirations().await.unwrap();

        let repo = EntitlementRepository::new(state.pool.clone());
        let soon = repo.get_by_email(&soon.email).await.unwrap().unwrap();
        assert!(soon.warned);
        assert!(!soon.ended);

        let gone = repo.get_by_email(&gone.email).await.unwrap().unwrap();
        assert!(gone.ended);

        let fresh = repo.get_by_email(&fresh.email).await.unwrap().unwrap();
        assert!(!fresh.warned);
        assert!(!fresh.ended);

        // Second sweep sees the flags and leaves everything alone.
        service.check_expirations().await.unwrap();
        let again = repo.get_by_email(&soon.email).await.unwrap().unwrap();
        assert!(again.warned);
    }

    #[tokio::test]
    async fn purge_respects_grace_and_tags() {
        let api = Arc::new(StubPanel::default());
        let now = Utc::now();

        // Expired last week: past grace, goes away.
        api.clients.lock().unwrap().push(panel_client(
            "EU-1-USER-1-oldpay",
            1,
            now - Duration::days(8),
        ));
        // Expired yesterday: inside the 7-day grace, stays.
        api.clients.lock().unwrap().push(panel_client(
            "EU-1-USER-2-recent",
            2,
            now - Duration::days(1),
        ));
        // Expired trial: no grace, goes away.
        api.clients.lock().unwrap().push(panel_client(
            "EU-1-TRIAL-3-tryout",
            3,
            now - Duration::hours(2),
        ));
        // Not ours: never touched.
        api.clients.lock().unwrap().push(panel_client(
            "legacy-client",
            0,
            now - Duration::days(30),
        ));

        let state = state_with_panel(api.clone()).await;
        seed_row(&state, "EU-1-USER-1-oldpay", 1, now - Duration::days(8), false).await;
        seed_row(&state, "EU-1-TRIAL-3-tryout", 3, now - Duration::hours(2), true).await;

        let service = MonitoringService::new(state.clone());
        service.purge_stale_clients().await.unwrap();

        let remaining: Vec<String> = api
            .clients
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.email.clone())
            .collect();
        assert_eq!(remaining, ["EU-1-USER-2-recent", "legacy-client"]);

        // The sweep only touches panels; expired ledger rows stay behind.
        let repo = EntitlementRepository::new(state.pool.clone());
        assert!(repo.get_by_email("EU-1-USER-1-oldpay").await.unwrap().is_some());
        assert!(repo.get_by_email("EU-1-TRIAL-3-tryout").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_corrects_drift_and_adopts_strays() {
        let api = Arc::new(StubPanel::default());
        let now = Utc::now();
        let panel_truth = now + Duration::days(25);

        // Known client whose ledger expiry drifted.
        api.clients.lock().unwrap().push(panel_client("EU-1-USER-1-driftd", 1, panel_truth));
        // Paid client the ledger has never seen, owner only in the email.
        api.clients.lock().unwrap().push(panel_client(
            "EU-1-USER-55-strayX",
            0,
            now + Duration::days(12),
        ));
        // Foreign client: ignored.
        api.clients.lock().unwrap().push(panel_client("legacy-client", 0, now + Duration::days(9)));

        let state = state_with_panel(api).await;
        seed_row(&state, "EU-1-USER-1-driftd", 1, now + Duration::days(2), false).await;

        let service = MonitoringService::new(state.clone());
        service.run_sync_once().await.unwrap();

        let repo = EntitlementRepository::new(state.pool.clone());
        let drifted = repo.get_by_email("EU-1-USER-1-driftd").await.unwrap().unwrap();
        assert!((drifted.expires_at - panel_truth).num_seconds().abs() < 2);

        let adopted = repo.get_by_email("EU-1-USER-55-strayX").await.unwrap().unwrap();
        assert_eq!(adopted.tg_id, 55);
        assert!(!adopted.is_trial);

        assert!(repo.get_by_email("legacy-client").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn intent_purge_uses_configured_ttl() {
        let api = Arc::new(StubPanel::default());
        let state = state_with_panel(api).await;

        let intents = IntentRepository::new(state.pool.clone());
        intents
            .create(&subgate_db::models::NewIntent {
                label: "1-aaaaaa".to_string(),
                tg_id: 1,
                kind: subgate_db::models::IntentKind::New,
                days: 30,
                amount: 89,
                email: "EU-1-USER-1-aaaaaa".to_string(),
                panel: "alpha".to_string(),
            })
            .await
            .unwrap();
        sqlx::query("UPDATE pending_intents SET created_at = ?")
            .bind(Utc::now() - Duration::hours(25))
            .execute(&state.pool)
            .await
            .unwrap();

        MonitoringService::new(state.clone())
            .purge_stale_intents()
            .await
            .unwrap();
        assert!(intents.get("1-aaaaaa").await.unwrap().is_none());
    }

    #[test]
    fn email_classification_honors_prefix() {
        assert_eq!(classify_email("EU-1-USER-42-a1b2c3", "EU-1"), Some(EmailKind::User));
        assert_eq!(classify_email("EU-1-TRIAL-42-a1b2c3", "EU-1"), Some(EmailKind::Trial));
        assert_eq!(classify_email("US-2-USER-42-a1b2c3", "EU-1"), None);
        assert_eq!(classify_email("someone-else", "EU-1"), None);
        assert_eq!(classify_email("EU-1-USERX-42-a1b2c3", "EU-1"), None);
    }

    #[test]
    fn owner_parses_from_the_right() {
        assert_eq!(owner_from_email("EU-1-USER-42-a1b2c3"), Some(42));
        assert_eq!(owner_from_email("EU-1-USER-123456789-ffffff"), Some(123456789));
        assert_eq!(owner_from_email("EU-1-USER-notanumber-ffffff"), None);
    }

    #[test]
    fn paid_keys_get_grace_trials_do_not() {
        let now = Utc::now();
        let expired_yesterday = now - Duration::days(1);
        let expired_last_week = now - Duration::days(8);

        assert!(!should_purge(EmailKind::User, expired_yesterday, now));
        assert!(should_purge(EmailKind::User, expired_last_week, now));

        assert!(should_purge(EmailKind::Trial, expired_yesterday, now));
        assert!(!should_purge(EmailKind::Trial, now + Duration::hours(1), now));
    }
}
