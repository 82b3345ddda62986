//! ParcelVault Settlement Engine Server
//!
//! Serves the loan lifecycle API and runs the reconciliation monitor.

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

use parcelvault_server::config::{Config, SettlementMode};
use parcelvault_server::engine::{EngineSettings, ReconciliationMonitor, SettlementEngine};
use parcelvault_server::ledger::{HttpLedgerSink, LedgerPublisher, LedgerSink};
use parcelvault_server::settlement::simulated::SimulatedNetwork;
use parcelvault_server::settlement::{HttpSettlementClient, SettlementClient};
use parcelvault_server::state::AppState;
use parcelvault_server::store::{LoanStore, PgLoanStore};
use parcelvault_server::{db, middleware};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(environment = config.environment.as_str(), "Starting ParcelVault");

    let pool = db::open(&config).await?;

    let store: Arc<dyn LoanStore> = Arc::new(PgLoanStore::new(pool));

    let client: Arc<dyn SettlementClient> = match config.settlement_mode {
        SettlementMode::Http => {
            tracing::info!(
                gateway = %config.settlement_gateway_url,
                horizon = %config.horizon_url,
                "Using settlement gateway"
            );
            Arc::new(HttpSettlementClient::new(
                config.settlement_gateway_url.clone(),
                config.horizon_url.clone(),
            ))
        }
        SettlementMode::Simulated => {
            tracing::warn!("Using the in-process simulated settlement network; no value moves");
            Arc::new(SimulatedNetwork::new())
        }
    };

    let sink: Option<Arc<dyn LedgerSink>> = match &config.ledger_url {
        Some(url) => {
            tracing::info!(ledger = %url, "Ledger mirroring enabled");
            Some(Arc::new(HttpLedgerSink::new(url.clone())) as Arc<dyn LedgerSink>)
        }
        None => {
            tracing::warn!("LEDGER_URL not set, lifecycle events are kept locally only");
            None
        }
    };
    let ledger = LedgerPublisher::new(sink, store.clone());

    let engine = Arc::new(SettlementEngine::new(
        store.clone(),
        client,
        ledger.clone(),
        EngineSettings::from_config(&config),
    ));

    // Start reconciliation monitor in background
    let monitor = ReconciliationMonitor::new(
        store,
        ledger,
        config.reconciliation_stale_after,
        config.reconciliation_interval,
    );
    tokio::spawn(async move {
        tracing::info!("Reconciliation monitor task started");
        parcelvault_server::engine::reconciliation_monitor(monitor).await;
        tracing::error!("Reconciliation monitor task exited unexpectedly");
    });

    let mut app = parcelvault_server::app(AppState::new(engine));
    if config.environment.is_production() {
        app = app.layer(axum::middleware::from_fn(middleware::hsts_header));
    }
    let app = app.layer(configure_cors(config.cors_allowed_origins.as_deref()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);
    tracing::info!("Health check at http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn configure_cors(allowed_origins: Option<&str>) -> CorsLayer {
    let allowed_origins = allowed_origins.unwrap_or_default();

    if allowed_origins.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
