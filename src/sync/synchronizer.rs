// =============================================================================
// Historical Synchronizer — resumable, bounded backfill of persisted ticks
// =============================================================================
//
// Pages through the upstream trade history from a resume point up to "now",
// writing each page through the store (insert-if-absent) before moving the
// cursor. Every loop is capped so it terminates under sustained upstream
// failure; hitting the cap is reported as `BackfillIncomplete`.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::runtime_config::SyncSettings;
use crate::source::TickSource;
use crate::storage::{run_blocking, Store};
use crate::types::Tick;

/// Wall-clock source in Unix milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Outcome of one completed backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
    /// Upstream records received, including ones outside the range.
    pub fetched: usize,
    /// Ticks newly written to the store.
    pub written: usize,
    pub iterations: u32,
}

pub struct HistoricalSynchronizer {
    source: Arc<dyn TickSource>,
    store: Arc<dyn Store>,
    settings: SyncSettings,
    clock: Clock,
}

impl HistoricalSynchronizer {
    pub fn new(source: Arc<dyn TickSource>, store: Arc<dyn Store>, settings: SyncSettings) -> Self {
        Self {
            source,
            store,
            settings,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    /// Where a sync of the last `window_minutes` should start.
    ///
    /// Empty or stale history restarts from the window; fresh history resumes
    /// one millisecond after the newest stored tick.
    pub async fn resume_point(&self, symbol: &str, window_minutes: i64, now_ms: i64) -> Result<i64> {
        let window_start = now_ms - window_minutes.max(0) * 60_000;
        let owned = symbol.to_string();
        let latest = run_blocking(&self.store, move |s| s.latest_tick_time(&owned)).await?;

        match latest {
            None => {
                debug!(symbol = %symbol, "no stored ticks, starting from window");
                Ok(window_start)
            }
            Some(ts) if ts < now_ms - self.settings.staleness_ms => {
                warn!(
                    symbol = %symbol,
                    latest_ms = ts,
                    "stored ticks are stale, skipping gap fill and starting from window"
                );
                Ok(window_start)
            }
            Some(ts) => {
                info!(symbol = %symbol, latest_ms = ts, "resuming from last stored tick");
                Ok(ts + 1)
            }
        }
    }

    /// Make sure the store holds the last `window_minutes` of ticks.
    #[instrument(skip(self), name = "sync::sync")]
    pub async fn sync(&self, symbol: &str, window_minutes: i64) -> Result<SyncReport> {
        let now = self.now_ms();
        let start = self.resume_point(symbol, window_minutes, now).await?;

        if start >= now {
            info!(symbol = %symbol, "tick history is up to date");
            return Ok(SyncReport {
                symbol: symbol.to_string(),
                start_ms: start,
                end_ms: now,
                ..SyncReport::default()
            });
        }

        let report = self.backfill_range(symbol, start, now).await?;
        info!(
            symbol = %symbol,
            written = report.written,
            iterations = report.iterations,
            "sync complete"
        );
        Ok(report)
    }

    pub async fn backfill_range(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<SyncReport> {
        self.backfill_range_with(symbol, start_ms, end_ms, &mut |_| {}).await
    }

    /// Backfill `[start_ms, end_ms]`, handing every stored page to `observer`.
    ///
    /// Records outside the range are discarded. Upstream and store errors are
    /// retried at the same cursor after `error_delay`; retries count towards
    /// the iteration cap.
    #[instrument(skip(self, observer), name = "sync::backfill")]
    pub async fn backfill_range_with(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        observer: &mut (dyn FnMut(&[Tick]) + Send),
    ) -> Result<SyncReport> {
        let s = &self.settings;
        let mut report = SyncReport {
            symbol: symbol.to_string(),
            start_ms,
            end_ms,
            ..SyncReport::default()
        };
        let mut cursor = start_ms;

        while cursor <= end_ms {
            if report.iterations >= s.max_iterations {
                error!(
                    symbol = %symbol,
                    cursor_ms = cursor,
                    written = report.written,
                    "backfill hit iteration cap"
                );
                return Err(EngineError::BackfillIncomplete {
                    symbol: symbol.to_string(),
                    iterations: report.iterations,
                    written: report.written,
                    cursor_ms: cursor,
                });
            }
            report.iterations += 1;

            let page = match self.source.historical_trades(symbol, cursor, s.page_limit).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(symbol = %symbol, cursor_ms = cursor, error = %e, "history fetch failed, retrying");
                    tokio::time::sleep(s.error_delay()).await;
                    continue;
                }
            };

            if page.is_empty() {
                debug!(symbol = %symbol, cursor_ms = cursor, "empty page, jumping ahead");
                cursor += s.empty_page_jump_ms;
                continue;
            }
            report.fetched += page.len();

            let mut max_seen: Option<i64> = None;
            let mut past_end = false;
            let mut ticks = Vec::with_capacity(page.len());
            for trade in &page {
                let ts = trade.trade_time_ms;
                if ts > end_ms {
                    past_end = true;
                    break;
                }
                if ts < start_ms {
                    continue;
                }
                max_seen = Some(max_seen.map_or(ts, |m| m.max(ts)));

                let tick = trade.to_tick(symbol);
                if tick.is_well_formed() {
                    ticks.push(tick);
                } else {
                    warn!(symbol = %symbol, trade_id = trade.id, "skipping malformed historical trade");
                }
            }

            if !ticks.is_empty() {
                let saved = run_blocking(&self.store, move |store| {
                    store.save_ticks(&ticks).map(|n| (n, ticks))
                })
                .await;
                match saved {
                    Ok((n, ticks)) => {
                        report.written += n;
                        observer(&ticks);
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, cursor_ms = cursor, error = %e, "tick write failed, retrying page");
                        tokio::time::sleep(s.error_delay()).await;
                        continue;
                    }
                }
            }

            cursor = match max_seen.map(|m| m + 1) {
                _ if past_end => end_ms.saturating_add(1),
                Some(next) if next > cursor => next,
                _ => cursor + s.stuck_advance_ms,
            };

            if cursor <= end_ms {
                tokio::time::sleep(s.inter_page_delay()).await;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::HistoricalTrade;
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    type PageFn = dyn Fn(i64, u16) -> Result<Vec<HistoricalTrade>> + Send + Sync;

    struct FakeSource {
        pages: Box<PageFn>,
        calls: Mutex<Vec<i64>>,
    }

    impl FakeSource {
        fn new(f: impl Fn(i64, u16) -> Result<Vec<HistoricalTrade>> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                pages: Box::new(f),
                calls: Mutex::new(Vec::new()),
            })
        }

        /// Serves `trades` (sorted) the way the upstream does.
        fn serving(trades: Vec<HistoricalTrade>) -> Arc<Self> {
            Self::new(move |start, limit| {
                Ok(trades
                    .iter()
                    .filter(|t| t.trade_time_ms >= start)
                    .take(limit as usize)
                    .cloned()
                    .collect())
            })
        }
    }

    #[async_trait]
    impl TickSource for FakeSource {
        async fn historical_trades(&self, _symbol: &str, start: i64, limit: u16) -> Result<Vec<HistoricalTrade>> {
            self.calls.lock().push(start);
            (self.pages)(start, limit)
        }
    }

    fn trade(id: i64, ts: i64) -> HistoricalTrade {
        HistoricalTrade {
            id,
            price: 100.0 + id as f64 * 0.5,
            quantity: 0.1,
            trade_time_ms: ts,
            taker_is_seller: id % 2 == 0,
        }
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            page_limit: 10,
            inter_page_delay_ms: 0,
            error_delay_ms: 0,
            ..SyncSettings::default()
        }
    }

    fn synchronizer(source: Arc<FakeSource>, store: Arc<dyn Store>, settings: SyncSettings) -> HistoricalSynchronizer {
        HistoricalSynchronizer::new(source, store, settings)
    }

    #[tokio::test]
    async fn backfill_keeps_only_requested_range() {
        let trades: Vec<_> = (0..91).map(|i| trade(i, 1_000 + i * 100)).collect();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(FakeSource::serving(trades), store.clone(), fast_settings());

        let report = sync.backfill_range("BTCUSDT", 2_000, 5_000).await.unwrap();
        assert_eq!(report.written, 31);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), 31);
        assert_eq!(store.latest_tick_time("BTCUSDT").unwrap(), Some(5_000));
    }

    #[tokio::test]
    async fn backfill_twice_is_idempotent() {
        let trades: Vec<_> = (0..50).map(|i| trade(i, 10_000 + i * 7)).collect();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(FakeSource::serving(trades), store.clone(), fast_settings());

        let first = sync.backfill_range("BTCUSDT", 0, 20_000).await.unwrap();
        let count = store.tick_count("BTCUSDT").unwrap();
        let second = sync.backfill_range("BTCUSDT", 0, 20_000).await.unwrap();

        assert_eq!(first.written, 50);
        assert_eq!(second.written, 0);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), count);
    }

    #[tokio::test]
    async fn observer_sees_stored_pages() {
        let trades: Vec<_> = (0..25).map(|i| trade(i, 1_000 + i)).collect();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(FakeSource::serving(trades), store, fast_settings());

        let mut seen = 0usize;
        sync.backfill_range_with("BTCUSDT", 0, 2_000, &mut |page| seen += page.len())
            .await
            .unwrap();
        assert_eq!(seen, 25);
    }

    #[tokio::test]
    async fn empty_pages_jump_the_cursor() {
        let source = FakeSource::new(|_, _| Ok(Vec::new()));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(source.clone(), store, fast_settings());

        let report = sync.backfill_range("BTCUSDT", 0, 300_000).await.unwrap();
        assert_eq!(report.iterations, 6);
        assert_eq!(*source.calls.lock(), vec![0, 60_000, 120_000, 180_000, 240_000, 300_000]);
    }

    #[tokio::test]
    async fn iteration_cap_reports_incomplete_backfill() {
        let source = FakeSource::new(|_, _| Err(EngineError::Upstream("timeout".into())));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let settings = SyncSettings {
            max_iterations: 3,
            ..fast_settings()
        };
        let sync = synchronizer(source.clone(), store, settings);

        let err = sync.backfill_range("BTCUSDT", 0, 1_000_000).await.unwrap_err();
        match err {
            EngineError::BackfillIncomplete { iterations, cursor_ms, .. } => {
                assert_eq!(iterations, 3);
                assert_eq!(cursor_ms, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Every retry stayed on the same cursor.
        assert_eq!(*source.calls.lock(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let trades: Vec<_> = (0..5).map(|i| trade(i, 500 + i)).collect();
        let failures = Mutex::new(2);
        let source = FakeSource::new(move |start, _| {
            let mut left = failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err(EngineError::RateLimited("429".into()));
            }
            Ok(trades.iter().filter(|t| t.trade_time_ms >= start).cloned().collect())
        });
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(source, store.clone(), fast_settings());

        let report = sync.backfill_range("BTCUSDT", 0, 1_000).await.unwrap();
        assert_eq!(report.written, 5);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), 5);
    }

    #[tokio::test]
    async fn degenerate_pages_still_terminate() {
        // Upstream ignores startTime and keeps returning the same trade.
        let source = FakeSource::new(|_, _| Ok(vec![trade(1, 5_000)]));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(source.clone(), store.clone(), fast_settings());

        let report = sync.backfill_range("BTCUSDT", 5_000, 8_000).await.unwrap();
        assert_eq!(*source.calls.lock(), vec![5_000, 5_001, 6_001, 7_001]);
        assert_eq!(report.written, 1);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_trades_are_skipped_but_advance_the_cursor() {
        let trades: Vec<_> = (0..6)
            .map(|i| {
                let mut t = trade(i, 1_000 + i);
                if i % 2 == 1 {
                    t.price = f64::NAN;
                }
                t
            })
            .collect();
        let source = FakeSource::serving(trades);
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let settings = SyncSettings {
            page_limit: 2,
            ..fast_settings()
        };
        let sync = synchronizer(source.clone(), store.clone(), settings);

        let report = sync.backfill_range("BTCUSDT", 0, 2_000).await.unwrap();
        assert_eq!(*source.calls.lock(), vec![0, 1_002, 1_004, 1_006]);
        assert_eq!(report.fetched, 6);
        assert_eq!(report.written, 3);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), 3);
    }

    #[tokio::test]
    async fn resume_point_policy() {
        const NOW: i64 = 1_700_000_000_000;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let sync = synchronizer(FakeSource::serving(Vec::new()), store.clone(), fast_settings())
            .with_clock(Arc::new(|| NOW));

        // Nothing stored.
        assert_eq!(sync.resume_point("BTCUSDT", 60, NOW).await.unwrap(), NOW - 3_600_000);

        // Only stale data.
        let stale = Tick::new("BTCUSDT", NOW - 86_400_001, 1.0, 1.0, crate::types::Side::Buy);
        store.save_ticks(&[stale]).unwrap();
        assert_eq!(sync.resume_point("BTCUSDT", 60, NOW).await.unwrap(), NOW - 3_600_000);

        // Fresh data resumes right after it.
        let fresh = Tick::new("BTCUSDT", NOW - 5_000, 1.0, 1.0, crate::types::Side::Sell);
        store.save_ticks(&[fresh]).unwrap();
        assert_eq!(sync.resume_point("BTCUSDT", 60, NOW).await.unwrap(), NOW - 4_999);
    }

    #[tokio::test]
    async fn sync_up_to_date_does_nothing() {
        const NOW: i64 = 2_000_000;
        let source = FakeSource::serving(Vec::new());
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .save_ticks(&[Tick::new("BTCUSDT", NOW, 1.0, 1.0, crate::types::Side::Buy)])
            .unwrap();
        let sync = synchronizer(source.clone(), store, fast_settings()).with_clock(Arc::new(|| NOW));

        let report = sync.sync("BTCUSDT", 60).await.unwrap();
        assert_eq!(report.written, 0);
        assert!(source.calls.lock().is_empty());
    }
}
