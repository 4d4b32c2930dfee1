// =============================================================================
// Central Application State — orderflow engine service graph
// =============================================================================
//
// Built once by the composition root and shared with every handler and
// background task via `Arc<AppState>`. Each service manages its own interior
// mutability; AppState only ties them together.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::broadcast::Broadcaster;
use crate::binance::RateLimitTracker;
use crate::market_data::{SharedAggregator, StreamConsumer, TickBuffer};
use crate::runtime_config::RuntimeConfig;
use crate::source::{CandleSource, TickSource, TradeFeed};
use crate::storage::Store;
use crate::sync::{CandleSynchronizer, GapScanner, HistoricalSynchronizer};
use crate::types::Timeframe;

/// Shared state handed to every axum handler and background task.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<dyn Store>,
    pub aggregator: Arc<SharedAggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub consumer: Arc<StreamConsumer>,
    pub synchronizer: Arc<HistoricalSynchronizer>,
    pub gap_scanner: Arc<GapScanner>,
    pub candle_sync: Arc<CandleSynchronizer>,
    /// Present when the history source is the Binance REST client.
    pub rate_limit: Option<Arc<RateLimitTracker>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the service graph and start the broadcaster pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn Store>,
        feed: Arc<dyn TradeFeed>,
        source: Arc<dyn TickSource>,
        candles: Arc<dyn CandleSource>,
        rate_limit: Option<Arc<RateLimitTracker>>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let aggregator = Arc::new(SharedAggregator::new(config.symbol.clone(), config.timeframe));
        let buffer = Arc::new(TickBuffer::new(config.batch_size, config.max_buffered_ticks));
        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_queue_capacity));

        let (updates_tx, updates_rx) = mpsc::channel(config.broadcast_queue_capacity.max(1));
        let pump = broadcaster.spawn_pump(updates_rx);

        let consumer = Arc::new(StreamConsumer::new(
            feed,
            Arc::clone(&aggregator),
            buffer,
            Arc::clone(&store),
            updates_tx,
            config.reconnect_delay(),
        )
        .with_max_clock_skew(config.max_clock_skew()));

        let synchronizer = Arc::new(HistoricalSynchronizer::new(
            source,
            Arc::clone(&store),
            config.sync.clone(),
        ));
        let gap_scanner = Arc::new(GapScanner::new(
            Arc::clone(&store),
            Arc::clone(&synchronizer),
            config.gap_scan.clone(),
        ));
        let candle_sync = Arc::new(CandleSynchronizer::new(
            candles,
            Arc::clone(&store),
            config.candle_sync.clone(),
            config.gap_scan.clone(),
        ));

        let state = Arc::new(Self {
            config,
            store,
            aggregator,
            broadcaster,
            consumer,
            synchronizer,
            gap_scanner,
            candle_sync,
            rate_limit,
            started_at: Instant::now(),
        });
        (state, pump)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Run a tick sync for `symbol` on a background task.
    pub fn spawn_sync(self: &Arc<Self>, symbol: String, window_minutes: i64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.synchronizer.sync(&symbol, window_minutes).await {
                Ok(report) => info!(
                    symbol = %symbol,
                    written = report.written,
                    "background tick sync finished"
                ),
                Err(e) => warn!(
                    symbol = %symbol,
                    error = %e,
                    retryable = e.is_retryable(),
                    "background tick sync failed"
                ),
            }
        })
    }

    /// Scan and fill gaps for `symbol`/`timeframe` on a background task.
    pub fn spawn_gap_fill(self: &Arc<Self>, symbol: String, timeframe: Timeframe) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.gap_scanner.scan_and_fill(&symbol, timeframe).await {
                Ok(reports) => info!(
                    symbol = %symbol,
                    timeframe = %timeframe,
                    filled = reports.len(),
                    "background gap fill finished"
                ),
                Err(e) => warn!(symbol = %symbol, error = %e, "background gap fill failed"),
            }
        })
    }
}
