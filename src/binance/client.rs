// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used, so no API key or request signing
// is involved. Every response feeds the shared rate-limit tracker.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::rate_limit::{RateLimitTracker, AGG_TRADES_WEIGHT, KLINES_WEIGHT};
use crate::error::{EngineError, Result};
use crate::source::{CandleSource, HistoricalCandle, HistoricalTrade, TickSource};
use crate::types::Timeframe;

/// Raw row of `GET /api/v3/aggTrades`.
#[derive(Debug, Deserialize)]
struct AggTradeRow {
    #[serde(rename = "a")]
    id: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

impl AggTradeRow {
    /// Undecodable decimals become NaN so the trade time still advances the
    /// backfill cursor; the tick itself is then dropped as malformed.
    fn into_trade(self) -> HistoricalTrade {
        let price = parse_decimal(self.id, "price", &self.price);
        let quantity = parse_decimal(self.id, "qty", &self.quantity);
        HistoricalTrade {
            id: self.id,
            price,
            quantity,
            trade_time_ms: self.trade_time,
            taker_is_seller: self.buyer_is_maker,
        }
    }
}

fn parse_decimal(id: i64, field: &str, raw: &str) -> f64 {
    raw.parse().unwrap_or_else(|e| {
        warn!(trade_id = id, field, raw, error = %e, "undecodable aggTrade decimal");
        f64::NAN
    })
}

/// Decode a page row by row. Only a body that is not a JSON array fails the
/// whole page; rows missing required fields are logged and skipped.
fn parse_agg_trades(body: &str) -> Result<Vec<HistoricalTrade>> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(body)?;
    let mut trades = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<AggTradeRow>(row) {
            Ok(row) => trades.push(row.into_trade()),
            Err(e) => warn!(error = %e, "skipping undecodable aggTrade row"),
        }
    }
    Ok(trades)
}

/// Decode `GET /api/v3/klines` rows:
/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
fn parse_klines(body: &str) -> Result<Vec<HistoricalCandle>> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(body)?;
    let mut candles = Vec::with_capacity(rows.len());
    for row in &rows {
        match kline_from_row(row) {
            Some(candle) => candles.push(candle),
            None => warn!(row = %row, "skipping undecodable kline row"),
        }
    }
    Ok(candles)
}

fn kline_from_row(row: &serde_json::Value) -> Option<HistoricalCandle> {
    let decimal = |i: usize| -> Option<f64> {
        row.get(i)?
            .as_str()?
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
    };
    Some(HistoricalCandle {
        open_time_ms: row.get(0)?.as_i64()?,
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        volume: decimal(5)?,
        close_time_ms: row.get(6)?.as_i64()?,
    })
}

/// Binance spot REST client for historical market data.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    /// GET /api/v3/aggTrades starting at `start_time_ms`.
    #[instrument(skip(self), name = "binance::get_agg_trades")]
    pub async fn get_agg_trades(
        &self,
        symbol: &str,
        start_time_ms: i64,
        limit: u16,
    ) -> Result<Vec<HistoricalTrade>> {
        let limit = limit.clamp(1, 1000).to_string();
        let start = start_time_ms.to_string();
        let query = [
            ("symbol", symbol),
            ("startTime", start.as_str()),
            ("limit", limit.as_str()),
        ];

        let body = self.public_get("/api/v3/aggTrades", &query, AGG_TRADES_WEIGHT).await?;
        let trades = parse_agg_trades(&body)?;
        debug!(count = trades.len(), "aggTrades page received");
        Ok(trades)
    }

    /// GET /api/v3/klines, from `start_time_ms` or the most recent page.
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time_ms: Option<i64>,
        limit: u16,
    ) -> Result<Vec<HistoricalCandle>> {
        let limit = limit.clamp(1, 1000).to_string();
        let start = start_time_ms.map(|ts| ts.to_string());
        let mut query = vec![
            ("symbol", symbol),
            ("interval", timeframe.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(start) = start.as_deref() {
            query.push(("startTime", start));
        }

        let body = self.public_get("/api/v3/klines", &query, KLINES_WEIGHT).await?;
        let candles = parse_klines(&body)?;
        debug!(count = candles.len(), "klines page received");
        Ok(candles)
    }

    /// Weight-checked unauthenticated GET returning the raw body.
    async fn public_get(&self, path: &str, query: &[(&str, &str)], weight: u32) -> Result<String> {
        if !self.rate_limit.can_send_request(weight) {
            let wait = self.rate_limit.until_reset();
            warn!(path, wait_ms = wait.as_millis() as u64, "local weight ceiling reached");
            return Err(EngineError::RateLimited(format!(
                "local weight ceiling reached, window resets in {} ms",
                wait.as_millis()
            )));
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;

        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body = resp.text().await?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(EngineError::RateLimited(format!(
                "GET {path} returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::Upstream(format!(
                "GET {path} returned {status}: {body}"
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl TickSource for BinanceClient {
    async fn historical_trades(
        &self,
        symbol: &str,
        start_time_ms: i64,
        limit: u16,
    ) -> Result<Vec<HistoricalTrade>> {
        self.get_agg_trades(symbol, start_time_ms, limit).await
    }
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_time_ms: Option<i64>,
        limit: u16,
    ) -> Result<Vec<HistoricalCandle>> {
        self.get_klines(symbol, timeframe, start_time_ms, limit).await
    }
}
