// =============================================================================
// Candle Synchronizer — OHLCV history straight from upstream klines
// =============================================================================
//
// Brings a stored (symbol, timeframe) series up to date from the kline API:
// resume at the newest stored bar (re-fetched, since it may have been written
// while still forming), page forward until the upstream reaches "now", then
// patch holes inside the lookback window with the klines that cover them.
// Only closed klines are written.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::gap_scanner::find_gaps_in;
use super::synchronizer::{system_clock, Clock};
use crate::error::Result;
use crate::runtime_config::{CandleSyncSettings, GapScanSettings};
use crate::source::CandleSource;
use crate::storage::{run_blocking, Store};
use crate::types::{Gap, OhlcvBar, Timeframe};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandleSyncReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Newest stored bar the sync resumed from, if any.
    pub resumed_from_ms: Option<i64>,
    pub pages: u32,
    pub fetched: usize,
    pub upserted: usize,
    pub gaps: usize,
    pub gap_bars: usize,
}

/// Outcome of one paged fetch.
#[derive(Debug, Default)]
struct PagedFetch {
    pages: u32,
    fetched: usize,
    upserted: usize,
}

pub struct CandleSynchronizer {
    source: Arc<dyn CandleSource>,
    store: Arc<dyn Store>,
    settings: CandleSyncSettings,
    gap_settings: GapScanSettings,
    clock: Clock,
}

impl CandleSynchronizer {
    pub fn new(
        source: Arc<dyn CandleSource>,
        store: Arc<dyn Store>,
        settings: CandleSyncSettings,
        gap_settings: GapScanSettings,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            gap_settings,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Open time of the newest stored bar.
    pub async fn resume_point(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<i64>> {
        let owned = symbol.to_string();
        let newest = run_blocking(&self.store, move |s| s.recent_ohlcv_timestamps(&owned, timeframe, 1)).await?;
        Ok(newest.first().copied())
    }

    /// Bring the stored series up to date, then fill gaps in the lookback.
    ///
    /// With nothing stored the most recent page of klines seeds the series.
    /// Pages written before an upstream error stay written; the error is
    /// returned.
    #[instrument(skip(self), name = "candles::sync")]
    pub async fn sync(&self, symbol: &str, timeframe: Timeframe) -> Result<CandleSyncReport> {
        let resumed_from_ms = self.resume_point(symbol, timeframe).await?;
        let forward = self.fetch_pages(symbol, timeframe, resumed_from_ms, None).await?;

        let mut report = CandleSyncReport {
            symbol: symbol.to_string(),
            timeframe,
            resumed_from_ms,
            pages: forward.pages,
            fetched: forward.fetched,
            upserted: forward.upserted,
            ..CandleSyncReport::default()
        };

        let gaps = self.find_gaps(symbol, timeframe).await?;
        report.gaps = gaps.len();
        for gap in gaps {
            let filled = self.fill_gap(symbol, timeframe, gap).await?;
            report.gap_bars += filled;
        }

        info!(
            symbol = %symbol,
            timeframe = %timeframe,
            upserted = report.upserted,
            gaps = report.gaps,
            gap_bars = report.gap_bars,
            "candle sync complete"
        );
        Ok(report)
    }

    async fn find_gaps(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Gap>> {
        let owned = symbol.to_string();
        let lookback = self.gap_settings.lookback_rows;
        let timestamps = run_blocking(&self.store, move |s| {
            s.recent_ohlcv_timestamps(&owned, timeframe, lookback)
        })
        .await?;
        Ok(find_gaps_in(&timestamps, timeframe.duration_ms(), self.gap_settings.jitter_tolerance_ms))
    }

    /// Write the klines opening inside `gap`. Returns bars written.
    pub async fn fill_gap(&self, symbol: &str, timeframe: Timeframe, gap: Gap) -> Result<usize> {
        let fetched = self
            .fetch_pages(symbol, timeframe, Some(gap.start_ms), Some(gap.end_ms))
            .await?;
        debug!(
            symbol = %symbol,
            start_ms = gap.start_ms,
            end_ms = gap.end_ms,
            bars = fetched.upserted,
            "kline gap filled"
        );
        Ok(fetched.upserted)
    }

    /// Page forward from `start` (or the latest page when `None`), writing
    /// closed klines. With `end` set, only klines opening in `[start, end]`
    /// are kept and paging stops once past it.
    async fn fetch_pages(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<PagedFetch> {
        let now = (self.clock)();
        let lower = start.unwrap_or(i64::MIN);
        let upper = end.unwrap_or(i64::MAX);
        let mut out = PagedFetch::default();
        let mut cursor = start;

        loop {
            if out.pages >= self.settings.max_pages {
                warn!(symbol = %symbol, cursor_ms = ?cursor, pages = out.pages, "kline paging hit page cap");
                break;
            }
            out.pages += 1;

            let batch = self
                .source
                .klines(symbol, timeframe, cursor, self.settings.page_limit)
                .await?;
            let Some(last) = batch.last().copied() else {
                break;
            };
            out.fetched += batch.len();

            let bars: Vec<OhlcvBar> = batch
                .iter()
                .filter(|k| k.close_time_ms <= now)
                .filter(|k| (lower..=upper).contains(&k.open_time_ms))
                .map(|k| k.to_bar())
                .collect();
            if !bars.is_empty() {
                let owned = symbol.to_string();
                out.upserted += run_blocking(&self.store, move |s| s.upsert_ohlcv(&owned, timeframe, &bars)).await?;
            }

            if last.close_time_ms >= now || last.open_time_ms > upper {
                break;
            }
            let next = last.close_time_ms.saturating_add(1);
            if cursor.is_some_and(|c| next <= c) {
                warn!(symbol = %symbol, cursor_ms = ?cursor, "kline page did not advance, stopping");
                break;
            }
            cursor = Some(next);
        }

        Ok(out)
    }
}
