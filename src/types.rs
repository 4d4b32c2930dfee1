// =============================================================================
// Shared types used across the orderflow engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Aggressor side of an executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Binance reports `m` = "buyer is maker", i.e. the taker sold.
    pub fn from_taker_is_seller(taker_is_seller: bool) -> Self {
        if taker_is_seller {
            Self::Sell
        } else {
            Self::Buy
        }
    }

    pub fn is_sell(self) -> bool {
        matches!(self, Self::Sell)
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// One executed trade. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        timestamp_ms: i64,
        price: f64,
        quantity: f64,
        side: Side,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp_ms,
            price,
            quantity,
            side,
        }
    }

    /// Ticks the aggregator must never see: non-positive timestamps,
    /// non-finite or non-positive prices, negative or non-finite quantities.
    pub fn is_well_formed(&self) -> bool {
        self.timestamp_ms > 0
            && self.price.is_finite()
            && self.price > 0.0
            && self.quantity.is_finite()
            && self.quantity >= 0.0
    }
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Nominal bucket width in milliseconds.
    pub fn duration_ms(self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::M1 => MINUTE,
            Self::M3 => 3 * MINUTE,
            Self::M5 => 5 * MINUTE,
            Self::M15 => 15 * MINUTE,
            Self::M30 => 30 * MINUTE,
            Self::H1 => 60 * MINUTE,
            Self::H4 => 240 * MINUTE,
            Self::D1 => 1_440 * MINUTE,
        }
    }

    /// `floor(timestamp / width) * width`, also for pre-epoch timestamps.
    /// Saturates at `i64::MIN` instead of overflowing.
    pub fn bucket_start(self, timestamp_ms: i64) -> i64 {
        let width = self.duration_ms();
        timestamp_ms.div_euclid(width).saturating_mul(width)
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::M1
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| EngineError::Config(format!("unsupported timeframe: {s}")))
    }
}

/// Range of missing buckets in a persisted series. Both bounds are bucket
/// starts on the timeframe grid and both are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Gap {
    /// Number of buckets the gap covers for a given step.
    pub fn missing_buckets(&self, step_ms: i64) -> i64 {
        if step_ms <= 0 || self.end_ms < self.start_ms {
            return 0;
        }
        (self.end_ms - self.start_ms) / step_ms + 1
    }
}

/// OHLCV values for one bucket, as written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub date_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A persisted OHLCV row. Unique by `(asset_id, timeframe, date_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    pub asset_id: i64,
    pub timeframe: Timeframe,
    pub date_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Tradable instrument, created lazily the first time a symbol is referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub symbol: String,
    #[serde(rename = "full_name")]
    pub display_name: String,
}
