//! Keeps a [`Client`] attached to a broker over WebSocket
//!
//! Each binary WebSocket message carries one length-prefixed frame. When the
//! socket drops, the session ends and a new one is opened after an exponential
//! backoff, which replays the client's subscriptions and transmitted signals.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::client::{Client, ConnectionState};
use crate::codec::{encode_frame, FrameDecoder};
use crate::config::WebsocketConfig;
use crate::endpoint::{Attach, Endpoint, Link};
use crate::error::{BusError, Result};
use crate::messages::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Background task driving a client's WebSocket uplink
pub struct WebsocketClient {
    client: Client,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebsocketClient {
    /// Start connecting `client` to the broker at `config.url`
    pub fn connect(client: Client, config: WebsocketConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(client.clone(), config, shutdown_rx));

        Self {
            client,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Close the socket and stop reconnecting
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for WebsocketClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn connect(url: &str) -> Result<WsStream> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| BusError::Connection(e.to_string()))?;
    Ok(ws)
}

async fn run(client: Client, config: WebsocketConfig, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    loop {
        client.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let connected = tokio::select! {
            result = connect(&config.url) => result,
            _ = shutdown.changed() => Err(BusError::Shutdown),
        };

        let result = match connected {
            Ok(ws) => {
                info!(url = %config.url, "Connected to broker");
                attempt = 0;
                pump(client.open_link(), ws, &mut shutdown).await
            }
            Err(e) => Err(e),
        };

        match result {
            Err(BusError::Shutdown) => break,
            Err(e) => warn!(url = %config.url, attempt, error = %e, "Broker connection lost"),
            Ok(()) => info!(url = %config.url, "Broker closed the connection"),
        }

        if *shutdown.borrow() || !config.auto_reconnect {
            break;
        }

        let delay = config.backoff(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    client.disconnect();
    client.set_state(ConnectionState::Disconnected);
}

async fn pump(link: Link, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    let Link { endpoint, outbound } = link;
    let (sink, mut stream) = ws.split();
    let mut send_task = tokio::spawn(send_frames(outbound, sink));
    let mut send_finished = false;

    let result = tokio::select! {
        result = receive_frames(&mut stream, &endpoint) => result,
        joined = &mut send_task => {
            send_finished = true;
            joined.unwrap_or_else(|e| Err(BusError::Transport(e.to_string())))
        }
        _ = shutdown.changed() => Err(BusError::Shutdown),
    };

    endpoint.dispose();
    if !send_finished {
        let _ = send_task.await;
    }

    result
}

async fn receive_frames(stream: &mut SplitStream<WsStream>, endpoint: &Arc<Endpoint>) -> Result<()> {
    let mut decoder = FrameDecoder::new(endpoint.max_frame_len());

    while let Some(message) = stream.next().await {
        match message.map_err(|e| BusError::Transport(e.to_string()))? {
            Message::Binary(data) => {
                for envelope in decoder.decode(&data)? {
                    endpoint.dispatch_received(envelope);
                }
            }
            Message::Close(_) => return Ok(()),
            Message::Text(_) => {
                warn!(endpoint = %endpoint.id(), "Ignoring text message from broker");
            }
            _ => {}
        }
    }

    Ok(())
}

async fn send_frames(
    mut outbound: mpsc::Receiver<Envelope>,
    mut sink: SplitSink<WsStream, Message>,
) -> Result<()> {
    while let Some(envelope) = outbound.recv().await {
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode envelope");
                continue;
            }
        };

        sink.send(Message::Binary(frame.into()))
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
    }

    let _ = sink.close().await;
    Ok(())
}
