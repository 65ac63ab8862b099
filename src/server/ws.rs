//! WebSocket push channel: one JSON snapshot per cycle.
//!
//! A client is let go when it falls behind the hub's backlog or when a single
//! write takes longer than one cycle period. Client text and binary input is
//! ignored; pings are answered by the protocol layer.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::AppState;
use crate::error::ClientDisconnect;
use crate::hub::Hub;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_ws(socket, hub))
}

pub async fn handle_ws(socket: WebSocket, hub: Hub) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    serve_push_client(&hub, &mut ws_tx, &mut ws_rx).await;
}

/// Feeds snapshots to one client until it closes, falls behind, stalls a
/// write or the hub shuts down. Returns why the client was let go.
pub(crate) async fn serve_push_client<S, R, E>(
    hub: &Hub,
    ws_tx: &mut S,
    ws_rx: &mut R,
) -> ClientDisconnect
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut subscription = hub.push_subscribe();
    let client = subscription.client_id();
    let shutdown = hub.shutdown_token();
    let deadline = hub.write_deadline();

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                }));
                let _ = timeout(deadline, ws_tx.send(close)).await;
                break ClientDisconnect::Closed;
            }
            next = subscription.next() => match next {
                Ok(json) => {
                    match timeout(deadline, ws_tx.send(Message::Text(json.as_ref().into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break ClientDisconnect::Closed,
                        Err(_) => break ClientDisconnect::Stalled,
                    }
                }
                Err(reason) => break reason,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    break ClientDisconnect::Closed;
                }
                Some(Ok(_)) => {}
            },
        }
    };

    match reason {
        ClientDisconnect::Lagged { missed } => {
            hub.record_drop(&reason);
            warn!(client, missed, "Push client fell behind; disconnecting");
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "too slow".into(),
            }));
            let _ = timeout(deadline, ws_tx.send(close)).await;
        }
        ClientDisconnect::Stalled => {
            hub.record_drop(&reason);
            warn!(client, "Push client write stalled; disconnecting");
        }
        ClientDisconnect::Closed => {
            debug!(client, "Push client closed");
        }
    }
    reason
}
