// Shared fixtures for handler-level tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::app_state::AppState;
use crate::error::Result;
use crate::runtime_config::RuntimeConfig;
use crate::source::{CandleSource, FeedConnection, HistoricalCandle, HistoricalTrade, TickSource, TradeFeed};
use crate::storage::{SqliteStore, Store};
use crate::types::Timeframe;

/// Feed whose connections never deliver a message.
pub struct IdleFeed;

struct IdleConnection;

#[async_trait]
impl TradeFeed for IdleFeed {
    async fn connect(&self, _symbol: &str) -> Result<Box<dyn FeedConnection>> {
        Ok(Box::new(IdleConnection))
    }
}

#[async_trait]
impl FeedConnection for IdleConnection {
    async fn recv(&mut self) -> Option<Result<String>> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

/// History source with no trades and no klines at all.
pub struct EmptySource;

#[async_trait]
impl TickSource for EmptySource {
    async fn historical_trades(
        &self,
        _symbol: &str,
        _start_time_ms: i64,
        _limit: u16,
    ) -> Result<Vec<HistoricalTrade>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl CandleSource for EmptySource {
    async fn klines(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _start_time_ms: Option<i64>,
        _limit: u16,
    ) -> Result<Vec<HistoricalCandle>> {
        Ok(Vec::new())
    }
}

/// Fully wired state over an in-memory store. Needs a tokio runtime.
pub fn test_state() -> Arc<AppState> {
    let mut config = RuntimeConfig::default();
    config.symbol = "BTCUSDT".into();
    config.reconnect_delay_ms = 10;
    config.sync.inter_page_delay_ms = 0;
    config.sync.error_delay_ms = 0;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let (state, _pump) = AppState::new(
        config,
        store,
        Arc::new(IdleFeed),
        Arc::new(EmptySource),
        Arc::new(EmptySource),
        None,
    );
    state
}
