//! Application entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mpesa_payment_orchestrator::api::{
    RateLimitConfig, create_router, create_router_with_rate_limit,
};
use mpesa_payment_orchestrator::app::{
    AppState, DEFAULT_PAYMENT_WINDOW_SECS, ExpiryScheduler, SweeperConfig, spawn_expiry_watcher,
    spawn_sweeper,
};
use mpesa_payment_orchestrator::infra::mpesa::{DEFAULT_REQUEST_TIMEOUT_SECS, SANDBOX_BASE_URL};
use mpesa_payment_orchestrator::infra::{
    DarajaGateway, MpesaConfig, PgInvoiceClient, PgNotificationSender, PostgresClient,
    PostgresConfig,
};

/// Application configuration
struct Config {
    database_url: String,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    /// Seconds a customer has to answer the STK prompt before the payment expires
    payment_timeout_secs: i64,
    /// Daraja connection settings (mock mode when credentials are absent)
    mpesa: MpesaConfig,
    /// Enable the periodic sweep that recovers overdue pending payments
    sweeper_enabled: bool,
    /// Seconds between sweeps (default: 30)
    sweeper_interval_secs: u64,
    /// Number of overdue payments to resolve per sweep cycle (default: 50)
    sweeper_batch_size: i64,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let payment_timeout_secs = env::var("PAYMENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_PAYMENT_WINDOW_SECS);

        let mpesa = Self::load_mpesa_config()?;

        let rate_limit_config = RateLimitConfig::from_env();

        // Sweeper configuration (restart-safety net for the expiry watcher)
        let sweeper_enabled = env::var("SWEEPER_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true); // Enabled by default for reliability

        let sweeper_interval_secs = env::var("SWEEPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30); // Default: 30 seconds

        let sweeper_batch_size = env::var("SWEEPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(50); // Default: 50 payments per cycle

        Ok(Self {
            database_url,
            host,
            port,
            enable_rate_limiting,
            rate_limit_config,
            payment_timeout_secs,
            mpesa,
            sweeper_enabled,
            sweeper_interval_secs,
            sweeper_batch_size,
        })
    }

    fn load_mpesa_config() -> Result<MpesaConfig> {
        let base_url = env::var("MPESA_BASE_URL").unwrap_or_else(|_| SANDBOX_BASE_URL.to_string());

        // Daraja credentials (optional pair - uses mock mode if neither is set)
        let consumer_key = env::var("MPESA_CONSUMER_KEY").ok().filter(|k| !k.is_empty());
        let consumer_secret = env::var("MPESA_CONSUMER_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        match (consumer_key.is_some(), consumer_secret.is_some()) {
            (true, false) => anyhow::bail!(
                "MPESA_CONSUMER_KEY is set but MPESA_CONSUMER_SECRET is not.\n\
                 Set both to talk to Daraja, or neither to run in mock mode."
            ),
            (false, true) => anyhow::bail!(
                "MPESA_CONSUMER_SECRET is set but MPESA_CONSUMER_KEY is not.\n\
                 Set both to talk to Daraja, or neither to run in mock mode."
            ),
            _ => {}
        }

        let passkey = env::var("MPESA_PASSKEY").unwrap_or_default();
        if consumer_key.is_some() && passkey.is_empty() {
            anyhow::bail!(
                "MPESA_PASSKEY is not set but Daraja credentials are configured.\n\
                 The Lipa na M-Pesa online passkey is required to derive STK push passwords."
            );
        }

        let shortcode = env::var("MPESA_SHORTCODE").unwrap_or_else(|_| "174379".to_string());
        let callback_url = env::var("MPESA_CALLBACK_URL")
            .unwrap_or_else(|_| "http://localhost:3000/payments/callback".to_string());
        let request_timeout_secs = env::var("MPESA_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(MpesaConfig {
            base_url,
            consumer_key,
            consumer_secret: consumer_secret.map(SecretString::from),
            shortcode,
            passkey: SecretString::from(passkey),
            callback_url,
            request_timeout: std::time::Duration::from_secs(request_timeout_secs),
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!(
        "🏗️  M-Pesa Payment Orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;

    info!("📦 Initializing infrastructure...");

    // Initialize database
    let db_config = PostgresConfig::default();
    let postgres_client = PostgresClient::new(&config.database_url, db_config).await?;
    postgres_client.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    // Get pool references for the settlement adapters (before moving postgres_client into Arc)
    let db_pool = postgres_client.pool().clone();

    // Initialize the Daraja gateway
    let gateway = DarajaGateway::new(config.mpesa.clone());
    if gateway.is_mock_mode() {
        warn!("   ⚠ Daraja gateway created (MOCK MODE - no MPESA_CONSUMER_KEY)");
    } else {
        info!("   ✓ Daraja gateway created ({})", config.mpesa.base_url);
        info!("   ✓ Callback URL: {}", config.mpesa.callback_url);
    }

    let invoices = PgInvoiceClient::new(db_pool.clone());
    let notifications = PgNotificationSender::new(db_pool);
    info!("   ✓ Invoice ledger and notification outbox ready");

    // Create application state wired to the expiry watcher's scheduler
    let (scheduler, expiry_jobs) = ExpiryScheduler::new();
    let app_state = AppState::with_scheduler(
        Arc::new(postgres_client),
        Arc::new(gateway),
        Arc::new(invoices),
        Arc::new(notifications),
        scheduler,
    )
    .with_payment_window(chrono::Duration::seconds(config.payment_timeout_secs));
    info!("   ✓ Payment window: {}s", config.payment_timeout_secs);

    let app_state = Arc::new(app_state);

    // Start the expiry watcher (one-shot deferred task per pending payment)
    let (_watcher_handle, watcher_shutdown_tx) =
        spawn_expiry_watcher(Arc::clone(&app_state.service), expiry_jobs);
    info!("   ✓ Expiry watcher started");

    // Start the sweeper (recovers payments whose watcher task was lost to a restart)
    let sweeper_shutdown_tx = if config.sweeper_enabled {
        let sweeper_config = SweeperConfig {
            interval_secs: config.sweeper_interval_secs,
            batch_size: config.sweeper_batch_size,
            enabled: true,
        };
        let (_sweeper_handle, shutdown_tx) =
            spawn_sweeper(sweeper_config, Arc::clone(&app_state.service));
        info!(
            "   ✓ Expiry sweeper started (interval: {}s, batch: {})",
            config.sweeper_interval_secs, config.sweeper_batch_size
        );
        Some(shutdown_tx)
    } else {
        info!("   ○ Expiry sweeper disabled");
        None
    };

    // Create router
    let router = if config.enable_rate_limiting {
        info!("   ✓ Rate limiting enabled");
        create_router_with_rate_limit(app_state, config.rate_limit_config)
    } else {
        info!("   ○ Rate limiting disabled");
        create_router(app_state)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal watcher and sweeper to shutdown
    let _ = watcher_shutdown_tx.send(true);
    if let Some(tx) = sweeper_shutdown_tx {
        let _ = tx.send(true);
    }

    info!("Server shutdown complete");
    Ok(())
}
