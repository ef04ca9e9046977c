use std::io;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subgate_db::init_db;
use subgate_db::repositories::AccountRepository;

use crate::config::Config;
use crate::panel::PanelPool;
use crate::payments::YooMoneyGateway;
use crate::services::monitoring::MonitoringService;
use crate::services::notification_service::NotificationService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;

mod api;
mod config;
mod error;
mod panel;
mod payments;
mod services;

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub config: Arc<Config>,
    pub panels: Arc<PanelPool>,
    pub accounts: AccountRepository,
    pub subscriptions: Arc<SubscriptionService>,
    pub referrals: Arc<ReferralService>,
    pub notifier: Arc<NotificationService>,
}

#[derive(Parser)]
#[command(name = "subgate")]
#[command(about = "VPN subscription control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and background sweeps
    Serve,
    /// Run one ledger reconciliation pass and exit
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("Subgate binary started. Version: {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = dotenvy::dotenv() {
        println!("⚠️  Warning: Failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subgate_api=debug,axum=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let config = Config::from_env()?;
    let pool = init_db(&config.database_url).await?;
    println!("Database initialized successfully.");

    let state = build_state(pool, config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(state).await?,
        Commands::Sync => {
            MonitoringService::new(state).run_sync_once().await?;
            println!("Reconciliation pass finished.");
        }
    }

    Ok(())
}

fn build_state(pool: sqlx::SqlitePool, config: Config) -> Result<AppState> {
    let config = Arc::new(config);
    let panels = Arc::new(PanelPool::from_config(&config.panels)?);
    let gateway = Arc::new(YooMoneyGateway::new(
        config.wallet.clone(),
        config.provider_token.clone(),
        config.payment_purpose.clone(),
    ));
    let notifier = Arc::new(NotificationService::new(&config.bot_token));
    let subscriptions = Arc::new(SubscriptionService::new(
        pool.clone(),
        panels.clone(),
        gateway,
        &config.client_prefix,
    ));
    let referrals = Arc::new(ReferralService::new(
        pool.clone(),
        subscriptions.clone(),
        notifier.clone(),
        &config.bot_username,
    ));
    let accounts = AccountRepository::new(pool.clone());

    Ok(AppState {
        pool,
        config,
        panels,
        accounts,
        subscriptions,
        referrals,
        notifier,
    })
}

async fn run_server(state: AppState) -> Result<()> {
    let monitoring = MonitoringService::new(state.clone());
    tokio::spawn(async move { monitoring.start().await });

    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = axum::Router::new()
        .route("/", get(api::client::health))
        .route("/import", get(api::client::import_redirect))
        .nest("/api", api::client::routes())
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
