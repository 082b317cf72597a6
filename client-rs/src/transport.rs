//! Transports that carry envelopes between two endpoints
//!
//! A byte stream gets length-prefixed frames in both directions. Two scopes in
//! the same process can skip serialization with [`attach_direct`], although
//! every envelope is still validated on the way across.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{encode_frame, FrameDecoder};
use crate::endpoint::{Attach, Endpoint, Link};
use crate::messages::Envelope;
use crate::validate::validate;

const READ_CHUNK: usize = 16 * 1024;

/// Drive `link` over a duplex byte stream until either side closes
///
/// The endpoint is disposed when the stream ends, fails or carries an
/// unrecoverable frame.
pub fn spawn_stream<T>(link: Link, io: T) -> JoinHandle<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(run_stream(link, io))
}

async fn run_stream<T>(link: Link, io: T)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let Link { endpoint, outbound } = link;
    let (reader, writer) = tokio::io::split(io);
    let mut write_task = tokio::spawn(write_frames(outbound, writer, endpoint.id()));

    tokio::select! {
        _ = read_frames(reader, &endpoint) => {
            endpoint.dispose();
            let _ = write_task.await;
        }
        _ = &mut write_task => {
            endpoint.dispose();
        }
    }
}

async fn read_frames<R>(mut reader: R, endpoint: &Arc<Endpoint>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(endpoint.max_frame_len());
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(endpoint = %endpoint.id(), "Stream closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(endpoint = %endpoint.id(), error = %e, "Read failed");
                return;
            }
        };

        match decoder.decode(&buf[..n]) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    endpoint.dispatch_received(envelope);
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint.id(), error = %e, "Framing error, closing stream");
                return;
            }
        }
    }
}

async fn write_frames<W>(mut outbound: mpsc::Receiver<Envelope>, mut writer: W, endpoint: Uuid)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Failed to encode envelope");
                continue;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            debug!(endpoint = %endpoint, error = %e, "Write failed");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Link a broker scope and a client scope inside one process
///
/// Returns the broker-side and client-side endpoints. Disposing either one
/// closes the other.
pub fn attach_direct<B, C>(broker: &B, client: &C) -> (Arc<Endpoint>, Arc<Endpoint>)
where
    B: Attach + ?Sized,
    C: Attach + ?Sized,
{
    let broker_link = broker.open_link();
    let client_link = client.open_link();
    let broker_endpoint = broker_link.endpoint.clone();
    let client_endpoint = client_link.endpoint.clone();

    tokio::spawn(forward(broker_link.outbound, client_link.endpoint));
    tokio::spawn(forward(client_link.outbound, broker_link.endpoint));

    (broker_endpoint, client_endpoint)
}

async fn forward(mut from: mpsc::Receiver<Envelope>, to: Arc<Endpoint>) {
    while let Some(mut envelope) = from.recv().await {
        for rejected in validate(&mut envelope) {
            warn!(endpoint = %to.id(), error = %rejected, "Dropping invalid entry");
        }
        to.dispatch_received(envelope);
    }

    debug!(endpoint = %to.id(), "Direct link closed");
    to.dispose();
}
