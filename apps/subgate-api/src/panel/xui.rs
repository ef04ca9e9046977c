use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{LookupStrategy, PanelConfig};

use super::{PanelClient, PanelError, ProvisioningApi};

/// HTTP client for a 3x-ui style panel. Sessions are cookie based; the
/// client logs in lazily and retries a failed call once after a fresh
/// login, which covers expired sessions.
pub struct XuiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    inbound_id: i64,
    lookup: LookupStrategy,
    logged_in: AtomicBool,
}

/// Every panel endpoint wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

/// Inbound as listed by the panel. `settings` is a JSON document encoded
/// as a string; the clients live inside it.
#[derive(Debug, Deserialize)]
struct RawInbound {
    id: i64,
    #[serde(default)]
    settings: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<PanelClient>,
}

/// Per-email traffic record, used by the direct lookup strategy. Carries
/// the owning inbound id but not the client settings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientTraffic {
    inbound_id: i64,
    #[allow(dead_code)]
    email: String,
}

#[derive(Debug, Serialize)]
struct ClientMutation {
    id: i64,
    settings: String,
}

impl XuiClient {
    pub fn new(cfg: &PanelConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            inbound_id: cfg.inbound_id,
            lookup: cfg.lookup,
            logged_in: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url("/login"))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let env: ApiEnvelope<serde_json::Value> = resp.json().await?;
        if !env.success {
            self.logged_in.store(false, Ordering::Relaxed);
            return Err(PanelError::Rejected(format!("login failed: {}", env.msg)));
        }
        self.logged_in.store(true, Ordering::Relaxed);
        debug!(panel = %self.base_url, "Panel session established");
        Ok(())
    }

    async fn ensure_login(&self) -> Result<(), PanelError> {
        if self.logged_in.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.login().await
    }

    async fn try_get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiEnvelope<T>, reqwest::Error> {
        self.http
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn try_post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiEnvelope<T>, reqwest::Error> {
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await?.error_for_status()?.json().await
    }

    /// One retry after a forced re-login. Expired sessions surface as
    /// auth errors or as non-JSON bodies, both land in the retry.
    async fn get_envelope<T: DeserializeOwned>(&self, path: &str) -> Result<ApiEnvelope<T>, PanelError> {
        self.ensure_login().await?;
        match self.try_get(path).await {
            Ok(env) => Ok(env),
            Err(first) => {
                debug!(error = %first, "Panel GET failed, re-authenticating");
                self.login().await?;
                self.try_get(path).await.map_err(PanelError::from)
            }
        }
    }

    async fn post_envelope<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiEnvelope<T>, PanelError> {
        self.ensure_login().await?;
        match self.try_post(path, body).await {
            Ok(env) => Ok(env),
            Err(first) => {
                debug!(error = %first, "Panel POST failed, re-authenticating");
                self.login().await?;
                self.try_post(path, body).await.map_err(PanelError::from)
            }
        }
    }

    async fn inbounds(&self) -> Result<Vec<(i64, Vec<PanelClient>)>, PanelError> {
        let env: ApiEnvelope<Vec<RawInbound>> = self.get_envelope("/panel/api/inbounds/list").await?;
        if !env.success {
            return Err(PanelError::Rejected(env.msg));
        }
        let raw = env.obj.unwrap_or_default();
        let mut out = Vec::with_capacity(raw.len());
        for inbound in raw {
            match serde_json::from_str::<InboundSettings>(&inbound.settings) {
                Ok(settings) => out.push((inbound.id, settings.clients)),
                Err(e) => {
                    // Inbounds managed by other tools can carry settings
                    // we cannot read; they hold no clients of ours.
                    warn!(inbound = inbound.id, error = %e, "Skipping unreadable inbound settings");
                }
            }
        }
        Ok(out)
    }

    async fn fetch_inbound(&self, id: i64) -> Result<Vec<PanelClient>, PanelError> {
        let env: ApiEnvelope<RawInbound> =
            self.get_envelope(&format!("/panel/api/inbounds/get/{id}")).await?;
        if !env.success {
            return Err(PanelError::Rejected(env.msg));
        }
        let raw = env.obj.ok_or(PanelError::ClientNotFound)?;
        let settings: InboundSettings = serde_json::from_str(&raw.settings)
            .map_err(|e| PanelError::Rejected(format!("unreadable inbound settings: {e}")))?;
        Ok(settings.clients)
    }

    fn mutation_body(&self, inbound_id: i64, client: &PanelClient) -> Result<ClientMutation, PanelError> {
        let settings = InboundSettings { clients: vec![client.clone()] };
        let settings = serde_json::to_string(&settings)
            .map_err(|e| PanelError::Rejected(format!("serialize client: {e}")))?;
        Ok(ClientMutation { id: inbound_id, settings })
    }

    async fn find_direct(&self, email: &str) -> Result<PanelClient, PanelError> {
        let env: ApiEnvelope<ClientTraffic> = self
            .get_envelope(&format!("/panel/api/inbounds/getClientTraffics/{email}"))
            .await?;
        if !env.success {
            return Err(PanelError::Rejected(env.msg));
        }
        let traffic = env.obj.ok_or(PanelError::ClientNotFound)?;
        let clients = self.fetch_inbound(traffic.inbound_id).await?;
        clients
            .into_iter()
            .find(|c| c.email == email)
            .ok_or(PanelError::ClientNotFound)
    }

    async fn find_scan(&self, email: &str) -> Result<PanelClient, PanelError> {
        for (_, clients) in self.inbounds().await? {
            if let Some(client) = clients.into_iter().find(|c| c.email == email) {
                return Ok(client);
            }
        }
        Err(PanelError::ClientNotFound)
    }

    /// Inbound that currently holds the client with this id.
    async fn inbound_of(&self, client_id: &str) -> Result<i64, PanelError> {
        for (inbound_id, clients) in self.inbounds().await? {
            if clients.iter().any(|c| c.id == client_id) {
                return Ok(inbound_id);
            }
        }
        Err(PanelError::ClientNotFound)
    }
}

#[async_trait]
impl ProvisioningApi for XuiClient {
    async fn client_count(&self) -> Result<u64, PanelError> {
        let total = self
            .inbounds()
            .await?
            .iter()
            .map(|(_, clients)| clients.len() as u64)
            .sum();
        Ok(total)
    }

    async fn list_clients(&self) -> Result<Vec<PanelClient>, PanelError> {
        Ok(self
            .inbounds()
            .await?
            .into_iter()
            .flat_map(|(_, clients)| clients)
            .collect())
    }

    async fn add_client(&self, client: &PanelClient) -> Result<(), PanelError> {
        let body = self.mutation_body(self.inbound_id, client)?;
        let env: ApiEnvelope<serde_json::Value> = self
            .post_envelope("/panel/api/inbounds/addClient", Some(&body))
            .await?;
        if !env.success {
            return Err(PanelError::Rejected(env.msg));
        }
        Ok(())
    }

    async fn find_client(&self, email: &str) -> Result<PanelClient, PanelError> {
        match self.lookup {
            LookupStrategy::Direct => self.find_direct(email).await,
            LookupStrategy::Scan => self.find_scan(email).await,
        }
    }

    async fn update_client(&self, client: &PanelClient) -> Result<(), PanelError> {
        let inbound_id = self.inbound_of(&client.id).await?;
        let body = self.mutation_body(inbound_id, client)?;
        let env: ApiEnvelope<serde_json::Value> = self
            .post_envelope(
                &format!("/panel/api/inbounds/updateClient/{}", client.id),
                Some(&body),
            )
            .await?;
        if !env.success {
            return Err(PanelError::Rejected(env.msg));
        }
        Ok(())
    }

    async fn delete_client(&self, email: &str) -> Result<u64, PanelError> {
        let mut targets = Vec::new();
        for (inbound_id, clients) in self.inbounds().await? {
            for client in clients.iter().filter(|c| c.email == email) {
                targets.push((inbound_id, client.id.clone()));
            }
        }

        let mut deleted = 0;
        for (inbound_id, client_id) in targets {
            let env: ApiEnvelope<serde_json::Value> = self
                .post_envelope::<serde_json::Value, ()>(
                    &format!("/panel/api/inbounds/{inbound_id}/delClient/{client_id}"),
                    None,
                )
                .await?;
            if !env.success {
                return Err(PanelError::Rejected(env.msg));
            }
            deleted += 1;
        }
        Ok(deleted)
    }
}
