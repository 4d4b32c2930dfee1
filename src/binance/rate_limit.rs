// =============================================================================
// Rate-Limit Tracker — keeps historical backfill under the request weight cap
// =============================================================================
//
// Binance enforces a request weight of 6000 per minute per IP on spot; we
// hard-cap ourselves below that. The tracker reads the `X-MBX-USED-WEIGHT-1M`
// header after every response and treats the value as stale once the UTC
// minute rolls over.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 4000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 3000;

/// Weight of one `GET /api/v3/aggTrades` call.
pub const AGG_TRADES_WEIGHT: u32 = 4;

/// Weight of one `GET /api/v3/klines` call at `limit <= 1000`.
pub const KLINES_WEIGHT: u32 = 2;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// UTC minute (`unix_secs / 60`) the weight was reported in.
    window_minute: AtomicI64,
}

/// Serialisable view of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

fn current_minute() -> i64 {
    chrono::Utc::now().timestamp().div_euclid(60)
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            window_minute: AtomicI64::new(current_minute()),
        }
    }

    /// Update the weight counter from Binance response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w, current_minute());
    }

    fn record_weight(&self, w: u32, minute: i64) {
        let prev = self.weight_at(minute);
        self.window_minute.store(minute, Ordering::Relaxed);
        self.used_weight_1m.store(w, Ordering::Relaxed);

        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    /// Weight used in `minute`; zero if the last report is from an older one.
    fn weight_at(&self, minute: i64) -> u32 {
        if self.window_minute.load(Ordering::Relaxed) == minute {
            self.used_weight_1m.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// `true` if `weight` more can be spent without crossing the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.can_send_at(weight, current_minute())
    }

    fn can_send_at(&self, weight: u32, minute: i64) -> bool {
        let current = self.weight_at(minute);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request deferred, would exceed rate-limit"
            );
        }
        allowed
    }

    /// Time left until the weight window resets.
    pub fn until_reset(&self) -> Duration {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let into_minute = now_ms.rem_euclid(60_000);
        Duration::from_millis((60_000 - into_minute) as u64)
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.weight_at(current_minute()),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("window_minute", &self.window_minute.load(Ordering::Relaxed))
            .finish()
    }
}
