// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin control surface over the engine: start/stop the live consumer, kick
// off background backfills and gap fills, and read the open candle, detected
// gaps, known assets and OHLCV history. Tick backfills and gap fills are
// spawned and acknowledged immediately; a history read first catches the
// series up from upstream klines.
//
// CORS is configured permissively; tighten it at the reverse proxy.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::binance::RateLimitSnapshot;
use crate::error::{EngineError, Result};
use crate::market_data::{CandleUpdate, StartOutcome, StopOutcome};
use crate::storage::run_blocking;
use crate::types::{Asset, Gap, OhlcvRecord, Timeframe};

/// Upper bound for `?limit=` on history reads.
const MAX_HISTORY_ROWS: usize = 5_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        // ── Live consumer ───────────────────────────────────────────
        .route("/ingest/start", post(ingest_start))
        .route("/ingest/stop", post(ingest_stop))
        .route("/candle/current", get(current_candle))
        // ── History ─────────────────────────────────────────────────
        .route("/load-ticks", post(load_ticks))
        .route("/gaps/fill", post(fill_gaps))
        .route("/gaps/:symbol/:timeframe", get(list_gaps))
        .route("/history/:symbol/:timeframe", get(history))
        .route("/assets", get(assets))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

fn normalise_symbol(raw: &str) -> Result<String> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::Config(format!("invalid symbol: {raw:?}")));
    }
    Ok(symbol)
}

// =============================================================================
// Health
// =============================================================================

async fn root() -> Json<Value> {
    Json(json!({ "message": "orderflow engine is running" }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    symbol: String,
    timeframe: Timeframe,
    ingestor_active: bool,
    subscribers: usize,
    buffered_ticks: usize,
    uptime_secs: u64,
    server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitSnapshot>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        symbol: state.consumer.symbol().to_string(),
        timeframe: state.config.timeframe,
        ingestor_active: state.consumer.is_running(),
        subscribers: state.broadcaster.subscriber_count(),
        buffered_ticks: state.consumer.buffered_ticks(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
        rate_limit: state.rate_limit.as_ref().map(|r| r.snapshot()),
    })
}

// =============================================================================
// Live consumer control
// =============================================================================

async fn ingest_start(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = match state.consumer.start() {
        StartOutcome::Started => "Started",
        StartOutcome::AlreadyRunning => "Already running",
    };
    info!(status, "ingest start requested");
    Json(json!({ "status": status }))
}

async fn ingest_stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = match state.consumer.stop() {
        StopOutcome::Stopped => "Stopped",
        StopOutcome::AlreadyStopped => "Already stopped",
    };
    info!(status, "ingest stop requested");
    Json(json!({ "status": status }))
}

async fn current_candle(State(state): State<Arc<AppState>>) -> Json<Option<CandleUpdate>> {
    Json(state.aggregator.snapshot().as_ref().map(CandleUpdate::from))
}

// =============================================================================
// Backfill triggers
// =============================================================================

#[derive(Deserialize)]
struct LoadTicksRequest {
    symbol: String,
    #[serde(default)]
    minutes: Option<i64>,
}

async fn load_ticks(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoadTicksRequest>,
) -> Result<Response> {
    let symbol = normalise_symbol(&req.symbol)?;
    let minutes = req
        .minutes
        .filter(|m| *m > 0)
        .unwrap_or(state.config.sync.default_window_minutes);

    info!(symbol = %symbol, minutes, "tick load requested");
    state.spawn_sync(symbol.clone(), minutes);

    let body = json!({
        "status": "Loading ticks in background",
        "symbol": symbol,
        "minutes": minutes,
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[derive(Deserialize)]
struct FillGapsRequest {
    symbol: String,
    timeframe: String,
}

async fn fill_gaps(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FillGapsRequest>,
) -> Result<Response> {
    let symbol = normalise_symbol(&req.symbol)?;
    let timeframe: Timeframe = req.timeframe.parse()?;

    info!(symbol = %symbol, timeframe = %timeframe, "gap fill requested");
    state.spawn_gap_fill(symbol.clone(), timeframe);

    let body = json!({
        "status": "Filling gaps in background",
        "symbol": symbol,
        "timeframe": timeframe,
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

// =============================================================================
// Reads
// =============================================================================

#[derive(Deserialize)]
struct GapQuery {
    lookback: Option<usize>,
}

async fn list_gaps(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(q): Query<GapQuery>,
) -> Result<Json<Vec<Gap>>> {
    let symbol = normalise_symbol(&symbol)?;
    let timeframe: Timeframe = timeframe.parse()?;
    let lookback = q
        .lookback
        .unwrap_or(state.gap_scanner.settings().lookback_rows)
        .max(2);

    let gaps = state.gap_scanner.find_gaps(&symbol, timeframe, lookback).await?;
    Ok(Json(gaps))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    /// Pull missing klines from upstream before reading. Defaults to true.
    sync: Option<bool>,
}

/// Stored OHLCV rows, oldest first. Unless `?sync=false`, the series is first
/// brought up to date from upstream klines; a failed sync still serves what
/// is stored.
async fn history(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<OhlcvRecord>>> {
    let symbol = normalise_symbol(&symbol)?;
    let timeframe: Timeframe = timeframe.parse()?;
    let limit = q.limit.unwrap_or(1_000).clamp(1, MAX_HISTORY_ROWS);

    if q.sync.unwrap_or(true) {
        if let Err(e) = state.candle_sync.sync(&symbol, timeframe).await {
            warn!(
                symbol = %symbol,
                timeframe = %timeframe,
                error = %e,
                "kline sync failed, serving stored history"
            );
        }
    }

    let rows = run_blocking(&state.store, move |s| s.ohlcv_history(&symbol, timeframe, limit)).await?;
    Ok(Json(rows))
}

async fn assets(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Asset>>> {
    let assets = run_blocking(&state.store, |s| s.list_assets()).await?;
    Ok(Json(assets))
}
