// =============================================================================
// Orderflow Engine — Main Entry Point
// =============================================================================
//
// Composition root: loads configuration, opens the store, wires the Binance
// adapters into the service graph and serves the control API until Ctrl+C.
// The live consumer stays idle unless `autostart_ingest` is set.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use orderflow_engine::api;
use orderflow_engine::app_state::AppState;
use orderflow_engine::binance::BinanceClient;
use orderflow_engine::market_data::BinanceTradeFeed;
use orderflow_engine::runtime_config::RuntimeConfig;
use orderflow_engine::storage::{run_blocking, SqliteStore, Store};

const DEFAULT_CONFIG_PATH: &str = "orderflow_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Orderflow engine starting up");

    let config_path =
        std::env::var("ORDERFLOW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load_or_init(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_overrides(|key| std::env::var(key).ok());

    info!(
        symbol = %config.symbol,
        timeframe = %config.timeframe,
        db = %config.db_path.display(),
        "Configuration resolved"
    );

    // ── 2. Adapters ──────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(
        &config.db_path,
        config.db_pool_size,
        config.db_acquire_timeout(),
    ));
    let feed = Arc::new(BinanceTradeFeed::new(config.stream_base_url.clone()));
    let client = BinanceClient::new(config.rest_base_url.clone())
        .context("failed to build Binance REST client")?;
    let rate_limit = Arc::clone(client.rate_limit());
    let client = Arc::new(client);

    // ── 3. Service graph ─────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let retention = config.ohlcv_retention_rows;
    let (state, _pump) = AppState::new(
        config,
        store,
        feed,
        client.clone(),
        client,
        Some(rate_limit),
    );

    match run_blocking(&state.store, move |s| s.prune_ohlcv(retention)).await {
        Ok(removed) => info!(removed, retention, "OHLCV retention applied"),
        Err(e) => warn!(error = %e, "OHLCV prune skipped"),
    }

    if state.config.autostart_ingest {
        state.consumer.start();
    }

    // ── 4. Periodic gap repair ───────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let scanner_task = if state.config.gap_scan.enabled {
        let scanner = Arc::clone(&state.gap_scanner);
        Some(tokio::spawn(scanner.run_periodic(
            state.config.symbol.clone(),
            state.config.timeframe,
            shutdown.child_token(),
        )))
    } else {
        None
    };

    // ── 5. API server ────────────────────────────────────────────────────
    let app = api::rest::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    shutdown.cancel();
    if let Some(task) = scanner_task {
        let _ = task.await;
    }
    state.consumer.stop_and_wait().await;

    info!("Orderflow engine shut down complete.");
    Ok(())
}
