//! Framed codec for the supervisor control channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for the envelope body.
//! Works over any AsyncRead/AsyncWrite (TCP, pipes, in-memory duplex).
//!
//! Framing errors are I/O errors and end the stream. Body errors are yielded as
//! `Ok(Err(DecodeError))` so a single bad frame never tears down the channel.

use std::io;

use serde::Deserialize;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Envelope, EventType};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown event type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: EventType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    nonce: Option<String>,
}

/// Serialize an envelope body (without framing).
pub fn encode(envelope: &Envelope) -> serde_json::Result<Bytes> {
    serde_json::to_vec(envelope).map(Bytes::from)
}

/// Decode an envelope body (without framing).
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let kind = EventType::parse(&raw.kind).ok_or(DecodeError::UnknownType(raw.kind))?;
    Ok(Envelope {
        kind,
        data: raw.data,
        nonce: raw.nonce,
    })
}

impl Envelope {
    /// Decode `data` into the payload type for this envelope's tag.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        T::deserialize(&self.data).map_err(|source| DecodeError::InvalidPayload {
            kind: self.kind,
            source,
        })
    }
}

/// Codec that frames envelopes with a 4-byte length prefix.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(|frame| decode(&frame)))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(kind = %item.kind, size_bytes = body.len(), "Encoding frame");
        self.inner.encode(body, dst)
    }
}
