// =============================================================================
// SQLite store — pooled connections, lazy bootstrap, idempotent writes
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info, instrument, warn};

use super::Store;
use crate::error::{EngineError, Result};
use crate::types::{Asset, OhlcvBar, OhlcvRecord, Tick, Timeframe};

pub type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol    TEXT NOT NULL UNIQUE,
    full_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS assets_prices (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id  INTEGER NOT NULL REFERENCES assets(id),
    date      INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    open      REAL NOT NULL,
    high      REAL NOT NULL,
    low       REAL NOT NULL,
    close     REAL NOT NULL,
    volume    REAL NOT NULL,
    UNIQUE(asset_id, date, timeframe)
);

CREATE INDEX IF NOT EXISTS idx_prices_lookup
    ON assets_prices(asset_id, timeframe, date);

CREATE TABLE IF NOT EXISTS market_ticks (
    time           INTEGER NOT NULL,
    symbol         TEXT NOT NULL,
    price          REAL NOT NULL,
    quantity       REAL NOT NULL,
    is_buyer_maker INTEGER NOT NULL,
    UNIQUE(time, symbol, price, quantity, is_buyer_maker)
);

CREATE INDEX IF NOT EXISTS idx_ticks_symbol_time
    ON market_ticks(symbol, time);
";

enum Location {
    File(PathBuf),
    Memory,
}

/// Connection-pooled SQLite store.
///
/// The pool is built on first use. If that fails (missing directory, locked
/// file) the error is returned to the caller and the next access tries again,
/// so a store that comes up late does not require a restart.
pub struct SqliteStore {
    location: Location,
    max_size: u32,
    acquire_timeout: Duration,
    pool: Mutex<Option<DbPool>>,
    assets: Mutex<HashMap<String, Asset>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, max_size: u32, acquire_timeout: Duration) -> Self {
        let store = Self {
            location: Location::File(path.as_ref().to_path_buf()),
            max_size: max_size.max(1),
            acquire_timeout,
            pool: Mutex::new(None),
            assets: Mutex::new(HashMap::new()),
        };
        if let Err(e) = store.pool() {
            warn!(error = %e, "store not ready yet (will retry on access)");
        }
        store
    }

    /// Private in-memory database. A single connection keeps every caller on
    /// the same database.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            location: Location::Memory,
            max_size: 1,
            acquire_timeout: Duration::from_secs(5),
            pool: Mutex::new(None),
            assets: Mutex::new(HashMap::new()),
        };
        store.pool()?;
        Ok(store)
    }

    fn pool(&self) -> Result<DbPool> {
        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self.build_pool()?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    fn build_pool(&self) -> Result<DbPool> {
        let builder = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.acquire_timeout);

        let pool = match &self.location {
            Location::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).map_err(|e| {
                        EngineError::StoreBootstrap(format!(
                            "cannot create {}: {e}",
                            dir.display()
                        ))
                    })?;
                }
                let manager = SqliteConnectionManager::file(path).with_init(|conn| {
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
                });
                builder.build(manager)
            }
            Location::Memory => builder
                .idle_timeout(None)
                .max_lifetime(None)
                .build(SqliteConnectionManager::memory()),
        }
        .map_err(|e| {
            error!(error = %e, "failed to create DB pool");
            EngineError::StoreBootstrap(e.to_string())
        })?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        info!(max_size = self.max_size, "SQLite pool ready");
        Ok(pool)
    }

    fn conn(&self) -> Result<DbConn> {
        Ok(self.pool()?.get()?)
    }

    fn asset_with(&self, conn: &rusqlite::Connection, symbol: &str) -> Result<Asset> {
        if let Some(asset) = self.assets.lock().get(symbol) {
            return Ok(asset.clone());
        }

        conn.execute(
            "INSERT OR IGNORE INTO assets (symbol, full_name) VALUES (?1, ?2)",
            params![symbol, symbol],
        )?;
        let asset = conn.query_row(
            "SELECT id, symbol, full_name FROM assets WHERE symbol = ?1",
            params![symbol],
            |row| {
                Ok(Asset {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    display_name: row.get(2)?,
                })
            },
        )?;

        self.assets
            .lock()
            .insert(symbol.to_string(), asset.clone());
        Ok(asset)
    }

    fn asset_id(&self, conn: &rusqlite::Connection, symbol: &str) -> Result<Option<i64>> {
        if let Some(asset) = self.assets.lock().get(symbol) {
            return Ok(Some(asset.id));
        }
        Ok(conn
            .query_row(
                "SELECT id FROM assets WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl Store for SqliteStore {
    #[instrument(skip_all, fields(count = ticks.len()), name = "store::save_ticks")]
    fn save_ticks(&self, ticks: &[Tick]) -> Result<usize> {
        if ticks.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO market_ticks
                     (time, symbol, price, quantity, is_buyer_maker)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for t in ticks {
                written += stmt.execute(params![
                    t.timestamp_ms,
                    t.symbol,
                    t.price,
                    t.quantity,
                    t.side.is_sell(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(written, skipped = ticks.len() - written, "ticks saved");
        Ok(written)
    }

    #[instrument(skip(self, bars), fields(count = bars.len()), name = "store::upsert_ohlcv")]
    fn upsert_ohlcv(&self, symbol: &str, timeframe: Timeframe, bars: &[OhlcvBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let asset = self.asset_with(&conn, symbol)?;
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO assets_prices
                     (asset_id, date, timeframe, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for b in bars {
                written += stmt.execute(params![
                    asset.id,
                    b.date_ms,
                    timeframe.as_str(),
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn latest_tick_time(&self, symbol: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let latest = conn.query_row(
            "SELECT MAX(time) FROM market_ticks WHERE symbol = ?1",
            params![symbol],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(latest)
    }

    fn recent_ohlcv_timestamps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let Some(asset_id) = self.asset_id(&conn, symbol)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT date FROM assets_prices
             WHERE asset_id = ?1 AND timeframe = ?2
             ORDER BY date DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![asset_id, timeframe.as_str(), limit as i64],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn ensure_asset(&self, symbol: &str) -> Result<Asset> {
        let conn = self.conn()?;
        self.asset_with(&conn, symbol)
    }

    fn list_assets(&self) -> Result<Vec<Asset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT id, symbol, full_name FROM assets ORDER BY symbol ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Asset {
                id: row.get(0)?,
                symbol: row.get(1)?,
                display_name: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn ohlcv_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<OhlcvRecord>> {
        let conn = self.conn()?;
        let Some(asset_id) = self.asset_id(&conn, symbol)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT date, open, high, low, close, volume FROM assets_prices
             WHERE asset_id = ?1 AND timeframe = ?2
             ORDER BY date DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![asset_id, timeframe.as_str(), limit as i64],
            |row| {
                Ok(OhlcvRecord {
                    asset_id,
                    timeframe,
                    date_ms: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;
        let mut records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    fn tick_count(&self, symbol: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM market_ticks WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    #[instrument(skip(self), name = "store::prune_ohlcv")]
    fn prune_ohlcv(&self, max_rows: u64) -> Result<usize> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM assets_prices", [], |row| row.get(0))?;
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
        if total <= limit {
            debug!(total, "OHLCV table within retention");
            return Ok(0);
        }

        let excess = total - limit;
        let deleted = conn.execute(
            "DELETE FROM assets_prices
             WHERE id IN (
                 SELECT id FROM assets_prices
                 ORDER BY date ASC
                 LIMIT ?1
             )",
            params![excess],
        )?;
        info!(deleted, remaining = total - deleted as i64, "pruned oldest OHLCV rows");
        Ok(deleted)
    }
}
