//! Value codec and length-prefixed framing
//!
//! Values and envelopes are JSON. On byte streams each envelope is written as a
//! 4-byte big-endian payload length followed by the payload.

use bytes::{Buf, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{trace, warn};

use crate::error::{BusError, Result};
use crate::messages::Envelope;
use crate::validate::validate;

const LEN_PREFIX: usize = 4;

/// Encode a value for a call argument or signal value
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a call argument or signal value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode an envelope as one length-prefixed frame
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    let len = u32::try_from(payload.len()).map_err(|_| BusError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a single frame payload and strip entries that fail validation
pub fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    let mut envelope: Envelope = serde_json::from_slice(payload)?;
    for rejected in validate(&mut envelope) {
        warn!(error = %rejected, "Dropping invalid entry");
    }
    Ok(envelope)
}

/// Incremental decoder for a stream of length-prefixed frames
///
/// Chunks may be split at any byte. Incomplete frames stay buffered until the
/// rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and return every envelope it completes
    ///
    /// Payloads that fail to decode are logged and skipped; invalid entries are
    /// stripped from otherwise good payloads. An
    /// oversized length prefix is fatal since the stream can no longer be
    /// resynchronized.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>> {
        self.buf.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        while self.buf.len() >= LEN_PREFIX {
            let mut prefix = [0u8; LEN_PREFIX];
            prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
            let len = u32::from_be_bytes(prefix) as usize;

            if len > self.max_frame_len {
                return Err(BusError::FrameTooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }

            if self.buf.len() < LEN_PREFIX + len {
                self.buf.reserve(LEN_PREFIX + len - self.buf.len());
                break;
            }

            self.buf.advance(LEN_PREFIX);
            let payload = self.buf.split_to(len);

            match decode_payload(&payload) {
                Ok(envelope) => {
                    trace!(len, "Decoded frame");
                    envelopes.push(envelope);
                }
                Err(e) => warn!(len, error = %e, "Dropping undecodable frame"),
            }
        }

        Ok(envelopes)
    }
}
