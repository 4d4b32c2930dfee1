// =============================================================================
// WebSocket Handler — live candle push
// =============================================================================
//
// Clients connect to `/ws` and receive:
//   1. The current open candle (if any) immediately on connect.
//   2. Every subsequent candle update as a JSON text frame.
//
// The handler answers Ping frames, ignores client text/binary frames and
// unsubscribes from the broadcaster on disconnect. A client that cannot keep
// up is dropped by the broadcaster and its socket is closed here.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::market_data::CandleUpdate;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.broadcaster.subscribe();
    let id = subscription.id;
    info!(subscriber = %id, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    if let Some(candle) = state.aggregator.snapshot() {
        let update = CandleUpdate::from(&candle);
        if let Err(e) = send_update(&mut sender, &update).await {
            debug!(subscriber = %id, error = %e, "initial snapshot not delivered");
            state.broadcaster.unsubscribe(id);
            return;
        }
    }

    loop {
        tokio::select! {
            update = subscription.receiver.recv() => {
                let Some(update) = update else {
                    debug!(subscriber = %id, "dropped by broadcaster, closing socket");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = send_update(&mut sender, &update).await {
                    debug!(subscriber = %id, error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(subscriber = %id, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe(id);
    info!(subscriber = %id, "WebSocket client disconnected");
}

async fn send_update<S>(sender: &mut S, update: &CandleUpdate) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(update) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Not a transport error; keep the connection.
            warn!(error = %e, "failed to serialise candle update");
            Ok(())
        }
    }
}
