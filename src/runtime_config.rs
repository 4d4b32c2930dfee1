// =============================================================================
// Runtime Configuration — JSON settings with serde defaults and atomic save
// =============================================================================
//
// Every tunable of the engine lives here. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
// Persistence uses an atomic tmp + rename pattern.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/orderflow.db")
}

fn default_db_pool_size() -> u32 {
    20
}

fn default_db_acquire_timeout_ms() -> u64 {
    2_000
}

fn default_ohlcv_retention_rows() -> u64 {
    500_000
}

fn default_batch_size() -> usize {
    50
}

fn default_max_buffered_ticks() -> usize {
    100_000
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_broadcast_queue_capacity() -> usize {
    1_024
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_page_limit() -> u16 {
    1_000
}

fn default_inter_page_delay_ms() -> u64 {
    20
}

fn default_empty_page_jump_ms() -> i64 {
    60_000
}

fn default_stuck_advance_ms() -> i64 {
    1_000
}

fn default_max_iterations() -> u32 {
    50_000
}

fn default_error_delay_ms() -> u64 {
    1_000
}

fn default_staleness_ms() -> i64 {
    86_400_000
}

fn default_window_minutes() -> i64 {
    60
}

fn default_lookback_rows() -> usize {
    5_000
}

fn default_jitter_tolerance_ms() -> i64 {
    1_000
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_max_clock_skew_ms() -> i64 {
    60_000
}

fn default_max_candle_pages() -> u32 {
    200
}

// =============================================================================
// SyncSettings
// =============================================================================

/// Pagination and retry policy for historical backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Records requested per page (upstream maximum is 1000).
    #[serde(default = "default_page_limit")]
    pub page_limit: u16,

    /// Fixed pause between pages to stay under the upstream rate limit.
    #[serde(default = "default_inter_page_delay_ms")]
    pub inter_page_delay_ms: u64,

    /// Cursor jump applied when a page comes back empty.
    #[serde(default = "default_empty_page_jump_ms")]
    pub empty_page_jump_ms: i64,

    /// Cursor jump applied when a page does not move the cursor forward.
    #[serde(default = "default_stuck_advance_ms")]
    pub stuck_advance_ms: i64,

    /// Hard cap on loop iterations (pages, empty pages and retries).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause after an upstream or store error before retrying the same cursor.
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,

    /// Persisted data older than this is treated as stale and not resumed from.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,

    /// Window used by `POST /load-ticks` when the request does not name one.
    #[serde(default = "default_window_minutes")]
    pub default_window_minutes: i64,
}

impl SyncSettings {
    pub fn inter_page_delay(&self) -> Duration {
        Duration::from_millis(self.inter_page_delay_ms)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            inter_page_delay_ms: default_inter_page_delay_ms(),
            empty_page_jump_ms: default_empty_page_jump_ms(),
            stuck_advance_ms: default_stuck_advance_ms(),
            max_iterations: default_max_iterations(),
            error_delay_ms: default_error_delay_ms(),
            staleness_ms: default_staleness_ms(),
            default_window_minutes: default_window_minutes(),
        }
    }
}

// =============================================================================
// GapScanSettings
// =============================================================================

/// Bounds for the periodic gap scan over persisted OHLCV rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapScanSettings {
    /// Run the periodic scan at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Only the most recent N rows are inspected; older gaps go undetected.
    #[serde(default = "default_lookback_rows")]
    pub lookback_rows: usize,

    /// Slack added to the nominal step before a difference counts as a gap.
    #[serde(default = "default_jitter_tolerance_ms")]
    pub jitter_tolerance_ms: i64,

    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
}

impl GapScanSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for GapScanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_rows: default_lookback_rows(),
            jitter_tolerance_ms: default_jitter_tolerance_ms(),
            interval_secs: default_scan_interval_secs(),
        }
    }
}

// =============================================================================
// CandleSyncSettings
// =============================================================================

/// Paging bounds for the upstream kline sync behind `/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSyncSettings {
    /// Klines requested per page (upstream maximum is 1000).
    #[serde(default = "default_page_limit")]
    pub page_limit: u16,

    /// Pages fetched per sync or per gap before giving up.
    #[serde(default = "default_max_candle_pages")]
    pub max_pages: u32,
}

impl Default for CandleSyncSettings {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            max_pages: default_max_candle_pages(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the orderflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument ----------------------------------------------------------

    /// Symbol aggregated by the live consumer.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Bucket width of the live candle.
    #[serde(default)]
    pub timeframe: Timeframe,

    /// Start the live consumer at boot instead of waiting for `/ingest/start`.
    #[serde(default)]
    pub autostart_ingest: bool,

    // --- Endpoints -----------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    // --- Store ---------------------------------------------------------------

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Upper bound on pooled connections (background + request load).
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,

    /// How long a caller waits for a pooled connection before it gets a
    /// retryable error.
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,

    /// OHLCV rows kept after the startup prune.
    #[serde(default = "default_ohlcv_retention_rows")]
    pub ohlcv_retention_rows: u64,

    // --- Live feed -----------------------------------------------------------

    /// Ticks buffered before a durable write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ceiling on buffered ticks while the store keeps rejecting writes.
    #[serde(default = "default_max_buffered_ticks")]
    pub max_buffered_ticks: usize,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Feed trades stamped further than this ahead of the local clock are
    /// dropped as malformed.
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: i64,

    /// Queue between the feed task and the broadcaster task.
    #[serde(default = "default_broadcast_queue_capacity")]
    pub broadcast_queue_capacity: usize,

    /// Per-subscriber queue; a subscriber that falls this far behind is dropped.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    // --- Background work -----------------------------------------------------

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub gap_scan: GapScanSettings,

    #[serde(default)]
    pub candle_sync: CandleSyncSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe: Timeframe::default(),
            autostart_ingest: false,
            bind_addr: default_bind_addr(),
            stream_base_url: default_stream_base_url(),
            rest_base_url: default_rest_base_url(),
            db_path: default_db_path(),
            db_pool_size: default_db_pool_size(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            ohlcv_retention_rows: default_ohlcv_retention_rows(),
            batch_size: default_batch_size(),
            max_buffered_ticks: default_max_buffered_ticks(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_clock_skew_ms: default_max_clock_skew_ms(),
            broadcast_queue_capacity: default_broadcast_queue_capacity(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            sync: SyncSettings::default(),
            gap_scan: GapScanSettings::default(),
            candle_sync: CandleSyncSettings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            timeframe = %config.timeframe,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load `path`, or write the defaults there on first run so operators
    /// have a file to edit.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        }
        config.save(path)?;
        info!(path = %path.display(), "no runtime config found, wrote defaults");
        Ok(config)
    }

    /// Persist the configuration to `path` (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `ORDERFLOW_*` overrides from a variable lookup (normally
    /// `std::env::var`). Invalid values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbol) = lookup("ORDERFLOW_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Some(tf) = lookup("ORDERFLOW_TIMEFRAME") {
            match tf.trim().parse::<Timeframe>() {
                Ok(tf) => self.timeframe = tf,
                Err(e) => warn!(error = %e, "ignoring ORDERFLOW_TIMEFRAME override"),
            }
        }
        if let Some(addr) = lookup("ORDERFLOW_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = lookup("ORDERFLOW_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_millis(self.max_clock_skew_ms.max(0) as u64)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.db_acquire_timeout_ms.max(1))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.timeframe, Timeframe::M1);
        assert!(!cfg.autostart_ingest);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(cfg.sync.page_limit, 1_000);
        assert_eq!(cfg.sync.staleness_ms, 86_400_000);
        assert_eq!(cfg.sync.empty_page_jump_ms, 60_000);
        assert!(cfg.gap_scan.enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.db_pool_size, 20);
        assert_eq!(cfg.sync.max_iterations, 50_000);
        assert_eq!(cfg.gap_scan.lookback_rows, 5_000);
        assert_eq!(cfg.max_clock_skew_ms, 60_000);
        assert_eq!(cfg.candle_sync.page_limit, 1_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "timeframe": "5m", "sync": { "page_limit": 500 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.timeframe, Timeframe::M5);
        assert_eq!(cfg.sync.page_limit, 500);
        assert_eq!(cfg.sync.inter_page_delay_ms, 20);
        assert_eq!(cfg.symbol, "BTCUSDT");
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("ORDERFLOW_SYMBOL", " ethusdt "),
            ("ORDERFLOW_TIMEFRAME", "15m"),
            ("ORDERFLOW_DB_PATH", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.timeframe, Timeframe::M15);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.bind_addr, "0.0.0.0:8001");
    }

    #[test]
    fn invalid_timeframe_override_is_ignored() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| (k == "ORDERFLOW_TIMEFRAME").then(|| "7m".to_string()));
        assert_eq!(cfg.timeframe, Timeframe::M1);
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = std::env::temp_dir().join(format!("orderflow-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbol = "SOLUSDT".into();
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbol, "SOLUSDT");
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn first_run_writes_default_config() {
        let dir = std::env::temp_dir().join(format!("orderflow-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.json");

        let cfg = RuntimeConfig::load_or_init(&path).unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert!(path.exists());

        // Second run reads the file instead of overwriting it.
        let mut edited = cfg.clone();
        edited.symbol = "ADAUSDT".into();
        edited.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load_or_init(&path).unwrap().symbol, "ADAUSDT");

        std::fs::remove_dir_all(&dir).ok();
    }
}
