// =============================================================================
// Engine Error Taxonomy
// =============================================================================
//
// Transient upstream and persistence failures are retried locally by their
// owning component. Only failures that exhaust a bounded retry budget travel
// upward, as one of the variants below.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream rate limit: {0}")]
    RateLimited(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("store not initialised: {0}")]
    StoreBootstrap(String),

    #[error(
        "backfill for {symbol} aborted after {iterations} iterations \
         ({written} ticks written, cursor at {cursor_ms})"
    )]
    BackfillIncomplete {
        symbol: String,
        iterations: u32,
        written: usize,
        cursor_ms: i64,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Whether the caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Upstream(_)
            | EngineError::RateLimited(_)
            | EngineError::Http(_)
            | EngineError::WebSocket(_) => true,

            // Busy/locked databases and pool exhaustion clear up on their own.
            EngineError::Database(_)
            | EngineError::PoolUnavailable(_)
            | EngineError::StoreBootstrap(_) => true,

            // A capped backfill can be re-triggered; it resumes from the store.
            EngineError::BackfillIncomplete { .. } => true,

            EngineError::Malformed(_)
            | EngineError::Json(_)
            | EngineError::Config(_)
            | EngineError::Task(_) => false,
        }
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        Self::PoolUnavailable(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Config(_) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert!(EngineError::Upstream("timeout".into()).is_retryable());
        assert!(EngineError::RateLimited("429".into()).is_retryable());
        assert!(EngineError::PoolUnavailable("exhausted".into()).is_retryable());
        assert!(EngineError::StoreBootstrap("no file".into()).is_retryable());
    }

    #[test]
    fn malformed_input_is_not_retryable() {
        assert!(!EngineError::Malformed("bad field".into()).is_retryable());
        assert!(!EngineError::Config("bad timeframe".into()).is_retryable());
    }

    #[test]
    fn backfill_incomplete_reports_progress() {
        let err = EngineError::BackfillIncomplete {
            symbol: "BTCUSDT".into(),
            iterations: 5,
            written: 42,
            cursor_ms: 1_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("BTCUSDT"));
        assert!(msg.contains("42 ticks"));
        assert!(err.is_retryable());
    }

    #[test]
    fn retryable_error_maps_to_service_unavailable() {
        let resp = EngineError::PoolUnavailable("busy".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = EngineError::Task("panicked".into()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = EngineError::Config("bad timeframe".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
