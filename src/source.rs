// =============================================================================
// Upstream collaborators — live push feed and paginated history
// =============================================================================

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{OhlcvBar, Side, Tick, Timeframe};

/// One trade as returned by the historical pull API.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalTrade {
    /// Monotonic upstream trade id.
    pub id: i64,
    pub price: f64,
    pub quantity: f64,
    pub trade_time_ms: i64,
    pub taker_is_seller: bool,
}

impl HistoricalTrade {
    pub fn to_tick(&self, symbol: &str) -> Tick {
        Tick::new(
            symbol,
            self.trade_time_ms,
            self.price,
            self.quantity,
            Side::from_taker_is_seller(self.taker_is_seller),
        )
    }
}

/// Paginated, rate-limited access to historical trades.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Up to `limit` trades with `trade_time_ms >= start_time_ms`, oldest first.
    async fn historical_trades(
        &self,
        symbol: &str,
        start_time_ms: i64,
        limit: u16,
    ) -> Result<Vec<HistoricalTrade>>;
}

/// One closed (or still forming) kline from the upstream candle API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoricalCandle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Last millisecond covered by the kline.
    pub close_time_ms: i64,
}

impl HistoricalCandle {
    pub fn to_bar(&self) -> OhlcvBar {
        OhlcvBar {
            date_ms: self.open_time_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Paginated access to upstream OHLCV klines.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Up to `limit` klines opening at or after `start_time_ms`, oldest first.
    /// Without a start the most recent `limit` klines are returned.
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time_ms: Option<i64>,
        limit: u16,
    ) -> Result<Vec<HistoricalCandle>>;
}

/// Live push feed of raw trade messages for one symbol.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    async fn connect(&self, symbol: &str) -> Result<Box<dyn FeedConnection>>;
}

/// An open feed connection.
#[async_trait]
pub trait FeedConnection: Send {
    /// Next text payload. `None` once the upstream closed the stream.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the underlying transport. Safe to call more than once.
    async fn close(&mut self);
}
