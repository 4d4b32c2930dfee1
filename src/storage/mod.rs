// =============================================================================
// Durable store — ticks, assets and OHLCV rows
// =============================================================================

pub mod sqlite;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{Asset, OhlcvBar, OhlcvRecord, Tick, Timeframe};

pub use sqlite::SqliteStore;

/// Persistence boundary used by every writer and reader in the engine.
///
/// Implementations are blocking; async callers go through [`run_blocking`].
/// Every write is idempotent: re-saving a tick is a no-op and re-upserting a
/// bar for an existing `(asset, timeframe, date)` overwrites it.
pub trait Store: Send + Sync {
    /// Insert ticks, ignoring ones already stored. Returns rows newly written.
    fn save_ticks(&self, ticks: &[Tick]) -> Result<usize>;

    /// Insert or replace OHLCV bars for `symbol`, creating the asset if needed.
    fn upsert_ohlcv(&self, symbol: &str, timeframe: Timeframe, bars: &[OhlcvBar])
        -> Result<usize>;

    /// Timestamp of the newest stored tick for `symbol`.
    fn latest_tick_time(&self, symbol: &str) -> Result<Option<i64>>;

    /// Bucket timestamps of the newest `limit` OHLCV rows, newest first.
    fn recent_ohlcv_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<i64>>;

    /// Look up `symbol`, creating it on first reference.
    fn ensure_asset(&self, symbol: &str) -> Result<Asset>;

    /// Every known asset, ordered by symbol.
    fn list_assets(&self) -> Result<Vec<Asset>>;

    /// Newest `limit` OHLCV rows, returned oldest first.
    fn ohlcv_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<OhlcvRecord>>;

    fn tick_count(&self, symbol: &str) -> Result<usize>;

    /// Delete the oldest OHLCV rows so that at most `max_rows` remain.
    fn prune_ohlcv(&self, max_rows: u64) -> Result<usize>;
}

/// Run a blocking store call off the async runtime, keeping the caller's span.
pub async fn run_blocking<T, F>(store: &Arc<dyn Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let parent_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || parent_span.in_scope(|| f(store.as_ref()))).await?
}
