// =============================================================================
// Candle Aggregator — footprint candles from the live trade stream
// =============================================================================
//
// Keeps exactly one open candle per (symbol, timeframe). Each tick updates
// OHLCV, delta and the per-price footprint in place; a tick for a newer
// bucket detaches the open candle and starts a fresh one.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::market_data::price_key::price_key;
use crate::types::{OhlcvBar, Side, Tick, Timeframe};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Buy/sell volume traded at one price level inside a candle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FootprintEntry {
    #[serde(rename = "buy")]
    pub buy_volume: f64,
    #[serde(rename = "sell")]
    pub sell_volume: f64,
}

/// OHLCV + delta + per-price-level volume for one bucket.
///
/// Mutable only while it is the open candle of its aggregator; once a tick
/// for a newer bucket arrives it is detached and never touched again.
///
/// `partial` is set when the feed was not connected for the whole bucket
/// (first candle after a (re)connect, or open across a disconnect). Partial
/// candles are shown live but never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub delta: f64,
    pub footprint: HashMap<String, FootprintEntry>,
    pub partial: bool,
}

impl Candle {
    /// A fresh candle seeded at `price` with no volume.
    fn open_at(symbol: &str, timeframe: Timeframe, bucket_start_ms: i64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            delta: 0.0,
            footprint: HashMap::new(),
            partial: false,
        }
    }

    /// Fold one tick into the running statistics. O(1) per tick.
    fn record(&mut self, tick: &Tick) {
        let price = tick.price;
        let qty = tick.quantity;

        self.close = price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.volume += qty;

        let level = self.footprint.entry(price_key(price)).or_default();
        match tick.side {
            Side::Buy => {
                self.delta += qty;
                level.buy_volume += qty;
            }
            Side::Sell => {
                self.delta -= qty;
                level.sell_volume += qty;
            }
        }
    }

    pub fn to_bar(&self) -> OhlcvBar {
        OhlcvBar {
            date_ms: self.bucket_start_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Wire form of the open candle pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleUpdate {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start_seconds: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub delta: f64,
    pub footprint: HashMap<String, FootprintEntry>,
}

impl From<&Candle> for CandleUpdate {
    fn from(c: &Candle) -> Self {
        Self {
            symbol: c.symbol.clone(),
            timeframe: c.timeframe,
            bucket_start_seconds: c.bucket_start_ms.div_euclid(1_000),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            delta: c.delta,
            footprint: c.footprint.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator -- the single open bucket of one (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Turns a stream of ticks into the current open candle.
///
/// States: no open candle, or one open candle at `bucket_start`. A tick whose
/// bucket is strictly newer resets; anything else (same bucket, or a late
/// tick) merges into the open candle.
pub struct CandleAggregator {
    symbol: String,
    timeframe: Timeframe,
    open: Option<Candle>,
    closed: Option<Candle>,
    /// Trades may have been missed since the last applied tick.
    interrupted: bool,
}

impl CandleAggregator {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            open: None,
            closed: None,
            interrupted: true,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Apply a tick and return the updated open candle. Never fails; the
    /// caller filters malformed ticks.
    pub fn apply(&mut self, tick: &Tick) -> &Candle {
        let bucket = self.timeframe.bucket_start(tick.timestamp_ms);

        let candle = match self.open.take() {
            Some(current) if bucket <= current.bucket_start_ms => {
                if bucket < current.bucket_start_ms {
                    self.log_late_tick(bucket, current.bucket_start_ms, tick);
                }
                current
            }
            previous => {
                if let Some(prev) = previous {
                    debug!(
                        symbol = %self.symbol,
                        timeframe = %self.timeframe,
                        closed_bucket = prev.bucket_start_ms,
                        new_bucket = bucket,
                        "candle closed"
                    );
                    self.closed = Some(prev);
                }
                Candle::open_at(&self.symbol, self.timeframe, bucket, tick.price)
            }
        };

        let candle = self.open.insert(candle);
        if self.interrupted {
            candle.partial = true;
            self.interrupted = false;
        }
        candle.record(tick);
        candle
    }

    /// The feed dropped or was (re)connected: the open candle and whichever
    /// candle the next tick lands in may be missing trades.
    pub fn mark_interrupted(&mut self) {
        if let Some(open) = self.open.as_mut() {
            open.partial = true;
        }
        self.interrupted = true;
    }

    /// Forget the open and detached candles, e.g. before a fresh start.
    pub fn discard_open(&mut self) {
        self.open = None;
        self.closed = None;
        self.interrupted = true;
    }

    /// The open candle, if any tick has been applied yet.
    pub fn current(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    /// Hand over the candle detached by the most recent reset. Only the
    /// latest closed candle is retained.
    pub fn take_closed(&mut self) -> Option<Candle> {
        self.closed.take()
    }

    fn log_late_tick(&self, bucket: i64, open_bucket: i64, tick: &Tick) {
        let steps_behind = (open_bucket - bucket) / self.timeframe.duration_ms();
        if steps_behind > 1 {
            warn!(
                symbol = %self.symbol,
                tick_ts = tick.timestamp_ms,
                open_bucket,
                steps_behind,
                "out-of-order tick more than one bucket behind; merged into open candle"
            );
        } else {
            debug!(
                symbol = %self.symbol,
                tick_ts = tick.timestamp_ms,
                open_bucket,
                "late tick merged into open candle"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// SharedAggregator -- single-writer access from multiple tasks
// ---------------------------------------------------------------------------

/// Result of one serialized apply.
#[derive(Debug, Clone)]
pub struct Applied {
    pub current: Candle,
    pub closed: Option<Candle>,
}

/// Mutex-guarded aggregator. Every apply and every snapshot holds the lock
/// for its whole duration, so readers never see a half-updated footprint or
/// a half-finished reset.
pub struct SharedAggregator {
    inner: Mutex<CandleAggregator>,
}

impl SharedAggregator {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            inner: Mutex::new(CandleAggregator::new(symbol, timeframe)),
        }
    }

    pub fn apply(&self, tick: &Tick) -> Applied {
        let mut agg = self.inner.lock();
        let current = agg.apply(tick).clone();
        let closed = agg.take_closed();
        Applied { current, closed }
    }

    /// Consistent copy of the open candle.
    pub fn snapshot(&self) -> Option<Candle> {
        self.inner.lock().current().cloned()
    }

    pub fn mark_interrupted(&self) {
        self.inner.lock().mark_interrupted();
    }

    pub fn discard_open(&self) {
        self.inner.lock().discard_open();
    }

    pub fn symbol(&self) -> String {
        self.inner.lock().symbol().to_string()
    }

    pub fn timeframe(&self) -> Timeframe {
        self.inner.lock().timeframe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn tick(ts: i64, price: f64, qty: f64, side: Side) -> Tick {
        Tick::new("BTCUSDT", ts, price, qty, side)
    }

    fn footprint_totals(c: &Candle) -> (f64, f64) {
        c.footprint.values().fold((0.0, 0.0), |(b, s), e| {
            (b + e.buy_volume, s + e.sell_volume)
        })
    }

    #[test]
    fn ohlcv_over_one_bucket() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        let ticks = [
            tick(1_000, 100.0, 1.0, Side::Buy),
            tick(2_000, 105.0, 0.5, Side::Sell),
            tick(3_000, 98.0, 2.0, Side::Buy),
            tick(4_000, 101.5, 0.25, Side::Sell),
        ];
        for t in &ticks {
            agg.apply(t);
        }

        let c = agg.current().unwrap();
        assert_eq!(c.bucket_start_ms, 0);
        assert!((c.open - 100.0).abs() < EPS);
        assert!((c.high - 105.0).abs() < EPS);
        assert!((c.low - 98.0).abs() < EPS);
        assert!((c.close - 101.5).abs() < EPS);
        assert!((c.volume - 3.75).abs() < EPS);
    }

    #[test]
    fn delta_is_buy_minus_sell() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(1_000, 100.0, 3.0, Side::Buy));
        let c = agg.apply(&tick(2_000, 100.0, 1.25, Side::Sell));
        assert!((c.delta - 1.75).abs() < EPS);
    }

    #[test]
    fn footprint_sums_match_volume_and_delta() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        let prices = [100.0, 100.5, 101.0, 100.5, 100.0, 99.5];
        for (i, p) in prices.iter().enumerate() {
            let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
            agg.apply(&tick(i as i64 * 100, *p, 0.1 * (i + 1) as f64, side));
        }

        let c = agg.current().unwrap();
        let (buy, sell) = footprint_totals(c);
        assert!((buy + sell - c.volume).abs() < EPS);
        assert!((buy - sell - c.delta).abs() < EPS);
        assert_eq!(c.footprint.len(), 4);
    }

    #[test]
    fn equal_prices_share_one_footprint_level() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(1_000, 100.000_000_00, 1.0, Side::Buy));
        agg.apply(&tick(2_000, 100.0, 2.0, Side::Sell));
        let c = agg.apply(&tick(3_000, 100.000_000_001, 0.5, Side::Buy));

        assert_eq!(c.footprint.len(), 1);
        let level = c.footprint["100"];
        assert!((level.buy_volume - 1.5).abs() < EPS);
        assert!((level.sell_volume - 2.0).abs() < EPS);
    }

    #[test]
    fn newer_bucket_resets_exactly_once() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(10_000, 100.0, 1.0, Side::Buy));
        agg.apply(&tick(50_000, 102.0, 1.0, Side::Sell));
        assert!(agg.take_closed().is_none());

        let c = agg.apply(&tick(61_000, 103.0, 0.5, Side::Buy)).clone();
        assert_eq!(c.bucket_start_ms, 60_000);
        assert!((c.open - 103.0).abs() < EPS);
        assert!((c.volume - 0.5).abs() < EPS);
        assert_eq!(c.footprint.len(), 1);

        let closed = agg.take_closed().expect("previous candle detached");
        assert_eq!(closed.bucket_start_ms, 0);
        assert!((closed.close - 102.0).abs() < EPS);
        assert!((closed.volume - 2.0).abs() < EPS);

        // More ticks in the new bucket do not produce another reset and do
        // not touch the detached candle.
        agg.apply(&tick(62_000, 90.0, 4.0, Side::Sell));
        assert!(agg.take_closed().is_none());
        assert!((closed.low - 100.0).abs() < EPS);
        assert!((closed.volume - 2.0).abs() < EPS);
    }

    #[test]
    fn late_tick_merges_into_open_candle() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(120_500, 100.0, 1.0, Side::Buy));
        // One bucket behind, then far behind: both merge.
        agg.apply(&tick(119_900, 99.0, 1.0, Side::Sell));
        let c = agg.apply(&tick(1_000, 150.0, 1.0, Side::Buy));

        assert_eq!(c.bucket_start_ms, 120_000);
        assert!((c.volume - 3.0).abs() < EPS);
        assert!((c.high - 150.0).abs() < EPS);
        assert!((c.low - 99.0).abs() < EPS);
        assert!(agg.take_closed().is_none());
    }

    #[test]
    fn update_wire_format_uses_seconds_and_short_keys() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M5);
        let c = agg.apply(&tick(1_700_000_000_000, 37_020.5, 0.2, Side::Sell)).clone();
        let update = CandleUpdate::from(&c);
        assert_eq!(update.bucket_start_seconds, 1_699_999_800);

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["bucketStartSeconds"], 1_699_999_800);
        assert_eq!(json["timeframe"], "5m");
        assert!((json["footprint"]["37020.5"]["sell"].as_f64().unwrap() - 0.2).abs() < EPS);
        assert_eq!(json["footprint"]["37020.5"]["buy"].as_f64().unwrap(), 0.0);
    }

    #[test]
    fn shared_aggregator_reports_closed_candle_once() {
        let shared = SharedAggregator::new("BTCUSDT", Timeframe::M1);
        assert!(shared.snapshot().is_none());

        let first = shared.apply(&tick(1_000, 10.0, 1.0, Side::Buy));
        assert!(first.closed.is_none());

        let second = shared.apply(&tick(60_001, 11.0, 1.0, Side::Buy));
        let closed = second.closed.expect("closed candle");
        assert_eq!(closed.bucket_start_ms, 0);
        assert_eq!(second.current.bucket_start_ms, 60_000);

        let snap = shared.snapshot().unwrap();
        assert_eq!(snap, second.current);
    }

    #[test]
    fn first_candle_after_start_is_partial() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(50_000, 100.0, 1.0, Side::Buy));
        assert!(agg.current().unwrap().partial);

        agg.apply(&tick(61_000, 101.0, 1.0, Side::Buy));
        assert!(agg.take_closed().unwrap().partial);
        assert!(!agg.current().unwrap().partial);
    }

    #[test]
    fn reconnect_marks_open_and_next_candle_partial() {
        let mut agg = CandleAggregator::new("BTCUSDT", Timeframe::M1);
        agg.apply(&tick(1_000, 100.0, 1.0, Side::Buy));
        agg.apply(&tick(61_000, 100.0, 1.0, Side::Buy));
        assert!(!agg.current().unwrap().partial);

        agg.mark_interrupted();
        assert!(agg.current().unwrap().partial);

        // Trades for 120_000..170_000 may have been missed.
        agg.apply(&tick(170_000, 100.0, 1.0, Side::Buy));
        assert!(agg.take_closed().unwrap().partial);
        assert!(agg.current().unwrap().partial);

        agg.apply(&tick(181_000, 100.0, 1.0, Side::Buy));
        assert!(agg.take_closed().unwrap().partial);
        assert!(!agg.current().unwrap().partial);
    }

    #[test]
    fn discard_open_forgets_state() {
        let shared = SharedAggregator::new("BTCUSDT", Timeframe::M1);
        shared.apply(&tick(1_000, 10.0, 1.0, Side::Buy));
        shared.discard_open();
        assert!(shared.snapshot().is_none());

        let applied = shared.apply(&tick(61_000, 11.0, 1.0, Side::Buy));
        assert!(applied.closed.is_none());
        assert!(applied.current.partial);
    }
}
