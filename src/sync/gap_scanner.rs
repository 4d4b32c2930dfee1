// =============================================================================
// Gap Scanner — finds holes in persisted OHLCV series and backfills them
// =============================================================================
//
// Only the newest `lookback` rows of a series are inspected; gaps older than
// that window are never detected. A fill fetches exactly the missing buckets,
// stores the ticks and upserts one OHLCV row per bucket that saw trades.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::synchronizer::HistoricalSynchronizer;
use crate::error::Result;
use crate::runtime_config::GapScanSettings;
use crate::storage::{run_blocking, Store};
use crate::types::{Gap, OhlcvBar, Timeframe};

/// Holes between consecutive timestamps of a series sampled every `step_ms`.
///
/// Input may be in any order; it is sorted and deduplicated first. A forward
/// difference larger than `step_ms + jitter_ms` yields
/// `Gap { start: earlier + step, end: later - step }`.
pub fn find_gaps_in(timestamps: &[i64], step_ms: i64, jitter_ms: i64) -> Vec<Gap> {
    if timestamps.len() < 2 || step_ms <= 0 {
        return Vec::new();
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    sorted
        .windows(2)
        .filter(|pair| pair[1] - pair[0] > step_ms + jitter_ms)
        .map(|pair| Gap {
            start_ms: pair[0] + step_ms,
            end_ms: pair[1] - step_ms,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapFillReport {
    pub gap: Gap,
    pub ticks_written: usize,
    pub bars_upserted: usize,
}

pub struct GapScanner {
    store: Arc<dyn Store>,
    synchronizer: Arc<HistoricalSynchronizer>,
    settings: GapScanSettings,
}

impl GapScanner {
    pub fn new(
        store: Arc<dyn Store>,
        synchronizer: Arc<HistoricalSynchronizer>,
        settings: GapScanSettings,
    ) -> Self {
        Self {
            store,
            synchronizer,
            settings,
        }
    }

    pub fn settings(&self) -> &GapScanSettings {
        &self.settings
    }

    /// Gaps within the newest `lookback` rows, oldest first.
    pub async fn find_gaps(&self, symbol: &str, timeframe: Timeframe, lookback: usize) -> Result<Vec<Gap>> {
        let owned = symbol.to_string();
        let timestamps = run_blocking(&self.store, move |s| {
            s.recent_ohlcv_timestamps(&owned, timeframe, lookback)
        })
        .await?;

        let gaps = find_gaps_in(&timestamps, timeframe.duration_ms(), self.settings.jitter_tolerance_ms);
        debug!(
            symbol = %symbol,
            timeframe = %timeframe,
            rows = timestamps.len(),
            gaps = gaps.len(),
            "gap scan finished"
        );
        Ok(gaps)
    }

    /// Backfill the buckets `gap.start_ms ..= gap.end_ms`.
    #[instrument(skip(self), name = "gaps::fill")]
    pub async fn fill_gap(&self, symbol: &str, timeframe: Timeframe, gap: Gap) -> Result<GapFillReport> {
        let step = timeframe.duration_ms();
        let range_end = gap.end_ms + step - 1;

        // Pages can overlap when the cursor does not advance past a trade;
        // count each trade once, keyed like the tick table.
        let mut seen: HashSet<(i64, u64, u64, bool)> = HashSet::new();
        let mut bars: BTreeMap<i64, OhlcvBar> = BTreeMap::new();
        let report = self
            .synchronizer
            .backfill_range_with(symbol, gap.start_ms, range_end, &mut |ticks| {
                for t in ticks {
                    let key = (t.timestamp_ms, t.price.to_bits(), t.quantity.to_bits(), t.side.is_sell());
                    if !seen.insert(key) {
                        continue;
                    }
                    let bucket = timeframe.bucket_start(t.timestamp_ms);
                    let bar = bars.entry(bucket).or_insert(OhlcvBar {
                        date_ms: bucket,
                        open: t.price,
                        high: t.price,
                        low: t.price,
                        close: t.price,
                        volume: 0.0,
                    });
                    bar.high = bar.high.max(t.price);
                    bar.low = bar.low.min(t.price);
                    bar.close = t.price;
                    bar.volume += t.quantity;
                }
            })
            .await?;

        let missing = gap.missing_buckets(step);
        if (bars.len() as i64) < missing {
            debug!(
                symbol = %symbol,
                missing,
                recovered = bars.len(),
                "some buckets had no upstream trades"
            );
        }

        let rows: Vec<OhlcvBar> = bars.into_values().collect();
        let owned = symbol.to_string();
        let bars_upserted = run_blocking(&self.store, move |s| s.upsert_ohlcv(&owned, timeframe, &rows)).await?;

        info!(
            symbol = %symbol,
            timeframe = %timeframe,
            start_ms = gap.start_ms,
            end_ms = gap.end_ms,
            ticks = report.written,
            bars = bars_upserted,
            "gap filled"
        );

        Ok(GapFillReport {
            gap,
            ticks_written: report.written,
            bars_upserted,
        })
    }

    /// Scan the configured lookback and fill every gap found. A failed fill
    /// is logged and does not stop the remaining ones.
    pub async fn scan_and_fill(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<GapFillReport>> {
        let gaps = self.find_gaps(symbol, timeframe, self.settings.lookback_rows).await?;
        let mut reports = Vec::with_capacity(gaps.len());
        for gap in gaps {
            match self.fill_gap(symbol, timeframe, gap).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(
                    symbol = %symbol,
                    start_ms = gap.start_ms,
                    end_ms = gap.end_ms,
                    error = %e,
                    "gap fill failed"
                ),
            }
        }
        Ok(reports)
    }

    /// Scan and fill every `interval` until `cancel` fires.
    pub async fn run_periodic(self: Arc<Self>, symbol: String, timeframe: Timeframe, cancel: CancellationToken) {
        let interval = self.settings.interval();
        info!(symbol = %symbol, timeframe = %timeframe, every_secs = interval.as_secs(), "periodic gap scan started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.scan_and_fill(&symbol, timeframe).await {
                Ok(reports) if !reports.is_empty() => {
                    info!(symbol = %symbol, filled = reports.len(), "periodic gap scan filled gaps");
                }
                Ok(_) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "periodic gap scan failed"),
            }
        }

        info!(symbol = %symbol, "periodic gap scan stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::SyncSettings;
    use crate::source::{HistoricalTrade, TickSource};
    use crate::storage::SqliteStore;
    use async_trait::async_trait;

    struct VecSource(Vec<HistoricalTrade>);

    #[async_trait]
    impl TickSource for VecSource {
        async fn historical_trades(&self, _symbol: &str, start: i64, limit: u16) -> Result<Vec<HistoricalTrade>> {
            Ok(self
                .0
                .iter()
                .filter(|t| t.trade_time_ms >= start)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    fn trade(id: i64, ts: i64, price: f64) -> HistoricalTrade {
        HistoricalTrade {
            id,
            price,
            quantity: 1.0,
            trade_time_ms: ts,
            taker_is_seller: false,
        }
    }

    fn bar(date_ms: i64) -> OhlcvBar {
        OhlcvBar {
            date_ms,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    fn scanner(trades: Vec<HistoricalTrade>, store: Arc<dyn Store>) -> GapScanner {
        let settings = SyncSettings {
            inter_page_delay_ms: 0,
            error_delay_ms: 0,
            ..SyncSettings::default()
        };
        let sync = HistoricalSynchronizer::new(Arc::new(VecSource(trades)), store.clone(), settings);
        GapScanner::new(store, Arc::new(sync), GapScanSettings::default())
    }

    #[test]
    fn evenly_spaced_series_has_no_gaps() {
        assert!(find_gaps_in(&[100_000, 160_000, 220_000], 60_000, 0).is_empty());
    }

    #[test]
    fn missing_buckets_are_reported() {
        let gaps = find_gaps_in(&[0, 60_000, 240_000], 60_000, 0);
        assert_eq!(
            gaps,
            vec![Gap {
                start_ms: 120_000,
                end_ms: 180_000
            }]
        );
    }

    #[test]
    fn order_and_duplicates_do_not_matter() {
        let gaps = find_gaps_in(&[240_000, 0, 60_000, 60_000], 60_000, 1_000);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].missing_buckets(60_000), 2);
    }

    #[test]
    fn jitter_within_tolerance_is_not_a_gap() {
        assert!(find_gaps_in(&[0, 60_500, 120_000], 60_000, 1_000).is_empty());
        assert_eq!(find_gaps_in(&[0, 61_500], 60_000, 1_000).len(), 1);
    }

    #[test]
    fn fewer_than_two_rows_yield_nothing() {
        assert!(find_gaps_in(&[], 60_000, 0).is_empty());
        assert!(find_gaps_in(&[42], 60_000, 0).is_empty());
    }

    #[tokio::test]
    async fn find_gaps_reads_store() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .upsert_ohlcv("BTCUSDT", Timeframe::M1, &[bar(0), bar(60_000), bar(240_000), bar(300_000)])
            .unwrap();
        let scanner = scanner(Vec::new(), store);

        let gaps = scanner.find_gaps("BTCUSDT", Timeframe::M1, 500).await.unwrap();
        assert_eq!(gaps, vec![Gap { start_ms: 120_000, end_ms: 180_000 }]);

        // A lookback that only covers the newest rows misses the older gap.
        assert!(scanner.find_gaps("BTCUSDT", Timeframe::M1, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fill_gap_builds_missing_bars_from_range_only() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .upsert_ohlcv("BTCUSDT", Timeframe::M1, &[bar(0), bar(60_000), bar(240_000)])
            .unwrap();

        let trades = vec![
            trade(1, 110_000, 5.0),
            trade(2, 130_000, 10.0),
            trade(3, 150_000, 12.0),
            trade(4, 170_000, 9.0),
            trade(5, 190_000, 20.0),
            trade(6, 239_999, 21.0),
            trade(7, 245_000, 99.0),
        ];
        let scanner = scanner(trades, store.clone());

        let reports = scanner.scan_and_fill("BTCUSDT", Timeframe::M1).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ticks_written, 5);
        assert_eq!(reports[0].bars_upserted, 2);

        let history = store.ohlcv_history("BTCUSDT", Timeframe::M1, 10).unwrap();
        let dates: Vec<i64> = history.iter().map(|r| r.date_ms).collect();
        assert_eq!(dates, vec![0, 60_000, 120_000, 180_000, 240_000]);

        let filled = &history[2];
        assert!((filled.open - 10.0).abs() < 1e-9);
        assert!((filled.high - 12.0).abs() < 1e-9);
        assert!((filled.low - 9.0).abs() < 1e-9);
        assert!((filled.close - 9.0).abs() < 1e-9);
        assert!((filled.volume - 3.0).abs() < 1e-9);

        // The bar for an existing bucket is untouched by out-of-range trades.
        assert!((history[4].close - 1.0).abs() < 1e-9);

        assert!(scanner.find_gaps("BTCUSDT", Timeframe::M1, 500).await.unwrap().is_empty());
    }

    /// Upstream that ignores `startTime` and re-serves the same trade.
    struct RepeatingSource(HistoricalTrade);

    #[async_trait]
    impl TickSource for RepeatingSource {
        async fn historical_trades(&self, _symbol: &str, _start: i64, _limit: u16) -> Result<Vec<HistoricalTrade>> {
            Ok(vec![self.0.clone()])
        }
    }

    #[tokio::test]
    async fn re_served_trades_are_counted_once() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .upsert_ohlcv("BTCUSDT", Timeframe::M1, &[bar(60_000), bar(240_000)])
            .unwrap();
        let settings = SyncSettings {
            inter_page_delay_ms: 0,
            error_delay_ms: 0,
            ..SyncSettings::default()
        };
        let source = Arc::new(RepeatingSource(trade(1, 130_000, 10.0)));
        let sync = HistoricalSynchronizer::new(source, store.clone(), settings);
        let scanner = GapScanner::new(store.clone(), Arc::new(sync), GapScanSettings::default());

        let gap = Gap { start_ms: 120_000, end_ms: 180_000 };
        let report = scanner.fill_gap("BTCUSDT", Timeframe::M1, gap).await.unwrap();
        assert_eq!(report.bars_upserted, 1);

        let history = store.ohlcv_history("BTCUSDT", Timeframe::M1, 10).unwrap();
        let filled = history.iter().find(|r| r.date_ms == 120_000).unwrap();
        assert!((filled.volume - 1.0).abs() < 1e-9);
        assert_eq!(store.tick_count("BTCUSDT").unwrap(), 1);
    }

    #[tokio::test]
    async fn periodic_scan_stops_on_cancel() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let scanner = Arc::new(scanner(Vec::new(), store));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(scanner.run_periodic("BTCUSDT".into(), Timeframe::M1, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("scan loop exits promptly")
            .unwrap();
    }
}
