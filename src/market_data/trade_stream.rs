// =============================================================================
// Trade Stream — Binance aggTrade WebSocket feed
// =============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::source::{FeedConnection, TradeFeed};
use crate::types::{Side, Tick};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live aggTrade feed for one symbol at a time.
pub struct BinanceTradeFeed {
    base_url: String,
}

impl BinanceTradeFeed {
    /// `base_url` is the raw-stream endpoint, e.g.
    /// `wss://stream.binance.com:9443/ws`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, symbol: &str) -> String {
        format!("{}/{}@aggTrade", self.base_url, symbol.to_lowercase())
    }
}

#[async_trait]
impl TradeFeed for BinanceTradeFeed {
    async fn connect(&self, symbol: &str) -> Result<Box<dyn FeedConnection>> {
        let url = self.stream_url(symbol);
        info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

        let (ws_stream, _response) = connect_async(&url).await?;
        info!(symbol = %symbol, "trade WebSocket connected");

        let (write, read) = ws_stream.split();
        Ok(Box::new(BinanceConnection {
            write,
            read,
            closed: false,
        }))
    }
}

struct BinanceConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    closed: bool,
}

#[async_trait]
impl FeedConnection for BinanceConnection {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = self.write.send(Message::Pong(payload)).await {
                        return Some(Err(e.into()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "trade WebSocket closed by server");
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.write.send(Message::Close(None)).await {
            debug!(error = %e, "close frame not delivered");
        }
        if let Err(e) = self.write.close().await {
            debug!(error = %e, "trade WebSocket sink close failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Parse a Binance aggTrade message into a tick for `symbol`.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000, "m": true }
/// ```
pub fn parse_agg_trade(text: &str, symbol: &str) -> Result<Tick> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::Malformed(format!("aggTrade is not JSON: {e}")))?;

    let price = decimal_field(&root, "p")?;
    let quantity = decimal_field(&root, "q")?;

    let timestamp_ms = root["T"]
        .as_i64()
        .ok_or_else(|| EngineError::Malformed("missing field T".into()))?;

    let taker_is_seller = root["m"]
        .as_bool()
        .ok_or_else(|| EngineError::Malformed("missing field m".into()))?;

    let tick = Tick::new(
        symbol,
        timestamp_ms,
        price,
        quantity,
        Side::from_taker_is_seller(taker_is_seller),
    );

    if !tick.is_well_formed() {
        warn!(price, quantity, timestamp_ms, "aggTrade with invalid price, quantity or time");
        return Err(EngineError::Malformed(format!(
            "invalid trade values: price={price} quantity={quantity} T={timestamp_ms}"
        )));
    }
    Ok(tick)
}

fn decimal_field(root: &serde_json::Value, key: &str) -> Result<f64> {
    root[key]
        .as_str()
        .ok_or_else(|| EngineError::Malformed(format!("missing field {key}")))?
        .parse()
        .map_err(|e| EngineError::Malformed(format!("failed to parse {key}: {e}")))
}
