// =============================================================================
// Orderflow Engine — library root
// =============================================================================
//
// Live trade ingestion into footprint candles, historical tick backfill,
// OHLCV gap repair and a small HTTP/WebSocket control surface.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod binance;
pub mod error;
pub mod market_data;
pub mod runtime_config;
pub mod source;
pub mod storage;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
