use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::PanelConfig;

pub mod xui;

pub use xui::XuiClient;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("panel rejected request: {0}")]
    Rejected(String),
    #[error("client not found")]
    ClientNotFound,
}

/// One VPN client as the backend sees it. Serialized straight onto the
/// panel wire, so the field names follow the panel's JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelClient {
    pub id: String,
    pub email: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub limit_ip: i64,
    #[serde(default)]
    pub sub_id: String,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub tg_id: i64,
    #[serde(default, rename = "totalGB")]
    pub total_gb: i64,
}

impl PanelClient {
    /// Panel expiry in UTC. `None` for the panel's "unlimited" (zero or
    /// negative) values.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expiry_time <= 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.expiry_time)
    }
}

fn default_true() -> bool {
    true
}

/// Panels report tgId as a number, a numeric string or an empty string
/// depending on version.
fn de_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    })
}

/// Remote operations one provisioning backend exposes. `add_client` is
/// not idempotent on the backend; callers guarantee at most one call per
/// confirmed intent.
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    async fn client_count(&self) -> Result<u64, PanelError>;
    async fn list_clients(&self) -> Result<Vec<PanelClient>, PanelError>;
    async fn add_client(&self, client: &PanelClient) -> Result<(), PanelError>;
    async fn find_client(&self, email: &str) -> Result<PanelClient, PanelError>;
    async fn update_client(&self, client: &PanelClient) -> Result<(), PanelError>;
    /// Deletes every client matching the email. No-op (Ok(0)) when absent.
    async fn delete_client(&self, email: &str) -> Result<u64, PanelError>;
}

pub struct Panel {
    pub name: String,
    key_template: String,
    api: Arc<dyn ProvisioningApi>,
}

impl Panel {
    pub fn from_config(cfg: &PanelConfig) -> anyhow::Result<Self> {
        Ok(Self {
            name: cfg.name.clone(),
            key_template: cfg.key_template.clone(),
            api: Arc::new(XuiClient::new(cfg)?),
        })
    }

    /// Test seam: any ProvisioningApi behind a panel name.
    pub fn with_api(name: &str, key_template: &str, api: Arc<dyn ProvisioningApi>) -> Self {
        Self {
            name: name.to_string(),
            key_template: key_template.to_string(),
            api,
        }
    }

    pub fn api(&self) -> &dyn ProvisioningApi {
        self.api.as_ref()
    }

    /// Pure access-key construction from the configured template. No I/O.
    pub fn access_key(&self, client_id: &str, email: &str, sub_id: &str) -> String {
        self.key_template
            .replace("{client_id}", client_id)
            .replace("{email}", email)
            .replace("{sub_id}", sub_id)
    }
}

/// The set of configured backends, in declaration order.
pub struct PanelPool {
    panels: Vec<Panel>,
}

impl PanelPool {
    pub fn new(panels: Vec<Panel>) -> Self {
        Self { panels }
    }

    pub fn from_config(cfgs: &[PanelConfig]) -> anyhow::Result<Self> {
        let panels = cfgs.iter().map(Panel::from_config).collect::<anyhow::Result<_>>()?;
        Ok(Self { panels })
    }

    pub fn by_name(&self, name: &str) -> Option<&Panel> {
        self.panels.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Panel> {
        self.panels.iter()
    }

    /// Least-loaded backend by live client count. A backend that errors
    /// on the count query is skipped; `None` only when every backend
    /// errored (or none are configured).
    pub async fn select_best(&self) -> Option<&Panel> {
        let counts = join_all(self.panels.iter().map(|p| p.api.client_count())).await;
        let loads: Vec<Option<u64>> = self
            .panels
            .iter()
            .zip(counts)
            .map(|(panel, count)| match count {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(panel = %panel.name, error = %e, "Panel excluded from selection");
                    None
                }
            })
            .collect();
        pick_least_loaded(&loads).map(|i| &self.panels[i])
    }
}

/// Minimum-load index; ties keep the earliest entry. `None` entries are
/// backends whose load query failed.
fn pick_least_loaded(loads: &[Option<u64>]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, load) in loads.iter().enumerate() {
        if let Some(n) = *load {
            if best.is_none_or(|(_, b)| n < b) {
                best = Some((i, n));
            }
        }
    }
    best.map(|(i, _)| i)
}
