// =============================================================================
// Stream Consumer — live feed lifecycle driving aggregation and persistence
// =============================================================================
//
// One long-lived task owns the feed connection. Per trade it updates the open
// candle, queues the snapshot for the broadcaster and buffers the tick for a
// batched write. Connection loss is retried after a fixed delay until `stop`
// cancels the task; cancellation also unblocks a pending receive.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::candle_aggregator::{Candle, CandleUpdate, SharedAggregator};
use super::tick_buffer::TickBuffer;
use super::trade_stream::parse_agg_trade;
use crate::source::{FeedConnection, TradeFeed};
use crate::storage::{run_blocking, Store};
use crate::types::Tick;

/// Trades stamped further ahead of the local clock than this are dropped.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

pub struct StreamConsumer {
    symbol: String,
    feed: Arc<dyn TradeFeed>,
    aggregator: Arc<SharedAggregator>,
    buffer: Arc<TickBuffer>,
    store: Arc<dyn Store>,
    updates: mpsc::Sender<CandleUpdate>,
    reconnect_delay: Duration,
    max_clock_skew: Duration,
    running: AtomicBool,
    connects: AtomicUsize,
    control: Mutex<Control>,
    writes: TaskTracker,
}

impl StreamConsumer {
    pub fn new(
        feed: Arc<dyn TradeFeed>,
        aggregator: Arc<SharedAggregator>,
        buffer: Arc<TickBuffer>,
        store: Arc<dyn Store>,
        updates: mpsc::Sender<CandleUpdate>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            symbol: aggregator.symbol(),
            feed,
            aggregator,
            buffer,
            store,
            updates,
            reconnect_delay,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            running: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            control: Mutex::new(Control::default()),
            writes: TaskTracker::new(),
        }
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connection attempts made since construction.
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn buffered_ticks(&self) -> usize {
        self.buffer.len()
    }

    /// Spawn the feed task on the current runtime.
    pub fn start(self: &Arc<Self>) -> StartOutcome {
        let mut control = self.control.lock();
        if control.cancel.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        // A candle left open by a previous run is missing everything traded
        // while stopped.
        self.aggregator.discard_open();

        let cancel = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(this.run(cancel.clone()));

        control.cancel = Some(cancel);
        control.handle = Some(handle);
        info!(symbol = %self.symbol, "stream consumer start requested");
        StartOutcome::Started
    }

    /// Cancel the feed task. Idempotent and callable from any task or thread;
    /// returns without waiting for the task to finish.
    pub fn stop(&self) -> StopOutcome {
        let Some(cancel) = self.control.lock().cancel.take() else {
            return StopOutcome::AlreadyStopped;
        };
        cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
        info!(symbol = %self.symbol, "stream consumer stop requested");
        StopOutcome::Stopped
    }

    /// Stop, then wait for the feed task, the final flush and every
    /// in-flight background write.
    pub async fn stop_and_wait(&self) -> StopOutcome {
        let outcome = self.stop();
        let handle = self.control.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "stream consumer task failed");
            }
        }
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
        outcome
    }

    // -------------------------------------------------------------------------
    // Feed loop
    // -------------------------------------------------------------------------

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(symbol = %self.symbol, "stream consumer started");

        while !cancel.is_cancelled() {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.feed.connect(&self.symbol) => res,
            };

            match connected {
                Ok(mut conn) => {
                    self.aggregator.mark_interrupted();
                    self.consume(conn.as_mut(), &cancel).await;
                    conn.close().await;
                }
                Err(e) => warn!(symbol = %self.symbol, error = %e, "feed connect failed"),
            }

            if cancel.is_cancelled() {
                break;
            }
            info!(
                symbol = %self.symbol,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "feed disconnected, reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        let remaining = self.buffer.drain();
        if !remaining.is_empty() {
            flush_batch(&self.store, &self.buffer, remaining).await;
        }
        info!(symbol = %self.symbol, "stream consumer stopped");
    }

    async fn consume(&self, conn: &mut dyn FeedConnection, cancel: &CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = conn.recv() => msg,
            };
            match msg {
                Some(Ok(text)) => self.handle_message(&text),
                Some(Err(e)) => {
                    warn!(symbol = %self.symbol, error = %e, "feed read error");
                    return;
                }
                None => {
                    warn!(symbol = %self.symbol, "feed stream ended");
                    return;
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        match parse_agg_trade(text, &self.symbol) {
            Ok(tick) if self.is_from_future(&tick) => warn!(
                symbol = %self.symbol,
                tick_ts = tick.timestamp_ms,
                max_skew_ms = self.max_clock_skew.as_millis() as u64,
                "skipping trade stamped ahead of local clock"
            ),
            Ok(tick) => self.process_tick(tick),
            Err(e) => warn!(symbol = %self.symbol, error = %e, "skipping undecodable trade message"),
        }
    }

    fn is_from_future(&self, tick: &Tick) -> bool {
        let skew = i64::try_from(self.max_clock_skew.as_millis()).unwrap_or(i64::MAX);
        let limit = chrono::Utc::now().timestamp_millis().saturating_add(skew);
        tick.timestamp_ms > limit
    }

    /// Apply one tick: aggregate, queue the snapshot, buffer for persistence.
    pub fn process_tick(&self, tick: Tick) {
        let applied = self.aggregator.apply(&tick);

        if let Err(e) = self.updates.try_send(CandleUpdate::from(&applied.current)) {
            debug!(error = %e, "candle update not queued for broadcast");
        }

        if let Some(closed) = applied.closed {
            self.persist_closed(closed);
        }

        if let Some(batch) = self.buffer.push(tick) {
            let store = Arc::clone(&self.store);
            let buffer = Arc::clone(&self.buffer);
            self.writes.spawn(async move {
                flush_batch(&store, &buffer, batch).await;
            });
        }
    }

    fn persist_closed(&self, closed: Candle) {
        if closed.partial {
            debug!(
                symbol = %closed.symbol,
                bucket_ms = closed.bucket_start_ms,
                "partial candle not persisted; left to gap repair"
            );
            return;
        }
        let store = Arc::clone(&self.store);
        self.writes.spawn(async move {
            let bar = closed.to_bar();
            let symbol = closed.symbol.clone();
            let timeframe = closed.timeframe;
            let res = run_blocking(&store, move |s| s.upsert_ohlcv(&symbol, timeframe, &[bar])).await;
            match res {
                Ok(_) => debug!(
                    symbol = %closed.symbol,
                    bucket_ms = closed.bucket_start_ms,
                    "closed candle persisted"
                ),
                Err(e) => warn!(
                    symbol = %closed.symbol,
                    bucket_ms = closed.bucket_start_ms,
                    error = %e,
                    "failed to persist closed candle"
                ),
            }
        });
    }
}

/// Write one batch; on failure hand it back to the buffer for the next flush.
async fn flush_batch(store: &Arc<dyn Store>, buffer: &TickBuffer, batch: Vec<Tick>) {
    let len = batch.len();
    let res = run_blocking(store, move |s| {
        Ok(match s.save_ticks(&batch) {
            Ok(n) => Ok(n),
            Err(e) => Err((e, batch)),
        })
    })
    .await;

    match res {
        Ok(Ok(written)) => debug!(batch = len, written, "tick batch flushed"),
        Ok(Err((e, batch))) => {
            warn!(batch = len, error = %e, retryable = e.is_retryable(), "tick batch write failed, requeued");
            buffer.requeue(batch);
        }
        Err(e) => error!(batch = len, error = %e, "tick batch writer crashed"),
    }
}
