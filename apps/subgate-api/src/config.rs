use std::env;

use anyhow::{Context, Result};
use serde::Deserialize;

/// One provisioning backend, declared in the `PANELS` env var as JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_inbound_id")]
    pub inbound_id: i64,
    #[serde(default)]
    pub lookup: LookupStrategy,
    /// Access-key template. `{client_id}`, `{email}` and `{sub_id}` are
    /// substituted; everything else passes through verbatim.
    pub key_template: String,
}

/// How the backend resolves a client by email. Older panels only offer
/// the full inbound scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupStrategy {
    Direct,
    #[default]
    Scan,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub bot_token: String,
    pub bot_username: String,
    pub wallet: String,
    pub provider_token: String,
    pub payment_purpose: String,
    pub client_prefix: String,
    pub panels: Vec<PanelConfig>,
    pub cors_origins: Vec<String>,
    pub intent_ttl_hours: i64,
    pub warn_sweep_minutes: u64,
    pub purge_sweep_minutes: u64,
    pub sync_sweep_minutes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let panels_raw = env::var("PANELS")
            .context("PANELS must be set (JSON array of panel definitions)")?;
        let panels: Vec<PanelConfig> =
            serde_json::from_str(&panels_raw).context("PANELS is not valid JSON")?;
        if panels.is_empty() {
            return Err(anyhow::anyhow!("PANELS must declare at least one panel"));
        }

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .context("PORT must be a number")?;

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://subgate.db".to_string()),
            bot_token: env::var("BOT_TOKEN").unwrap_or_default(),
            bot_username: env::var("BOT_USERNAME").unwrap_or_default(),
            wallet: env::var("YOOMONEY_WALLET").context("YOOMONEY_WALLET must be set")?,
            provider_token: env::var("YOOMONEY_TOKEN").context("YOOMONEY_TOKEN must be set")?,
            payment_purpose: env::var("PAYMENT_PURPOSE")
                .unwrap_or_else(|_| "VPN subscription".to_string()),
            client_prefix: env::var("CLIENT_PREFIX").unwrap_or_else(|_| "EU-1".to_string()),
            panels,
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            intent_ttl_hours: parse_or("INTENT_TTL_HOURS", 24),
            warn_sweep_minutes: parse_or("WARN_SWEEP_MINUTES", 180),
            purge_sweep_minutes: parse_or("PURGE_SWEEP_MINUTES", 1440),
            sync_sweep_minutes: parse_or("SYNC_SWEEP_MINUTES", 1460),
        })
    }
}

fn default_inbound_id() -> i64 {
    1
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
