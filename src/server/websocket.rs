//! WebSocket front-end for a broker scope
//!
//! Serves either a [`Server`](crate::Server) or a [`Hub`](crate::Hub). Each
//! binary WebSocket message carries one length-prefixed frame.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use rpcbus_client::codec::{encode_frame, FrameDecoder};
use rpcbus_client::{Attach, Link};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub scope: Arc<dyn Attach + Send + Sync>,
}

impl WsState {
    pub fn new<S>(scope: S) -> Self
    where
        S: Attach + Send + Sync + 'static,
    {
        Self {
            scope: Arc::new(scope),
        }
    }
}

/// Create the WebSocket router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let Link {
        endpoint,
        mut outbound,
    } = state.scope.open_link();
    let conn_id = endpoint.id();

    info!(conn_id = %conn_id, "WebSocket client attached");

    // Spawn task to forward outbound envelopes to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let frame = match encode_frame(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "Failed to encode envelope");
                    continue;
                }
            };

            if sender.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut decoder = FrameDecoder::new(endpoint.max_frame_len());

    // Process incoming messages
    loop {
        let msg_result = tokio::select! {
            msg = receiver.next() => msg,
            _ = &mut send_task => break,
        };

        match msg_result {
            Some(Ok(Message::Binary(data))) => match decoder.decode(&data) {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        endpoint.dispatch_received(envelope);
                    }
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, error = %e, "Framing error, closing connection");
                    break;
                }
            },
            Some(Ok(Message::Text(_))) => {
                warn!(conn_id = %conn_id, "Ignoring text message");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // Handled automatically by axum
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Cleanup
    debug!(conn_id = %conn_id, "WebSocket client disconnected");
    endpoint.dispose();
    if !send_task.is_finished() {
        let _ = send_task.await;
    }
}

/// Run the WebSocket server
pub async fn run_websocket_server(bind_addr: SocketAddr, state: WsState) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "WebSocket server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
