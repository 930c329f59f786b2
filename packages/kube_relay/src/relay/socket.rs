//! Dashboard WebSocket connection loop.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, warn};

use super::hub::{Flow, RelayHub};
use super::protocol::ClientMessage;
use crate::error::RelayError;

/// Serve one dashboard connection until either side goes away.
pub async fn handle_socket(socket: WebSocket, hub: RelayHub) {
    let (conn, mut rx) = hub.connect().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send messages to WebSocket
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming messages
    let input_hub = hub.clone();
    let input_conn = conn.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let flow = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => input_hub.handle(&input_conn, client_msg).await,
                        Err(e) => {
                            input_hub
                                .reject(&input_conn, RelayError::InvalidMessage(e.to_string()))
                                .await;
                            Flow::Continue
                        }
                    };
                    if flow == Flow::Close {
                        debug!(conn_id = %input_conn, "Client requested disconnect");
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    input_hub
                        .reject(
                            &input_conn,
                            RelayError::InvalidMessage("expected a JSON text message".into()),
                        )
                        .await;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!(conn_id = %input_conn, "WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %conn, "Sender task ended"),
        _ = input_task => debug!(conn_id = %conn, "Input task ended"),
    }

    hub.disconnect(&conn).await;
}
