//! Outbound side of the control channel.
//!
//! [`ControlChannel`] is a cheap, cloneable handle. Sends are queued onto an
//! unbounded mpsc and written by a single writer task ([`run_writer`]), so
//! callers never wait on the socket and frames are never interleaved.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{Envelope, EventType};

/// How long [`ControlChannel::request`] waits for a correlated reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("control channel closed")]
    Closed,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outstanding requests keyed by nonce.
///
/// Each nonce resolves at most once; the first matching reply wins.
#[derive(Clone, Default)]
pub struct PendingReplies {
    inner: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, nonce: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(nonce, tx);
        rx
    }

    fn cancel(&self, nonce: &str) {
        self.inner.remove(nonce);
    }

    /// Hand `envelope` to the request waiting on its nonce.
    ///
    /// Returns the envelope back if nothing is waiting for it.
    pub fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        let Some(nonce) = envelope.nonce.as_deref() else {
            return Err(envelope);
        };
        let Some((_, waiter)) = self.inner.remove(nonce) else {
            return Err(envelope);
        };
        if waiter.send(envelope).is_err() {
            tracing::debug!("Reply arrived after requester gave up");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Clone)]
pub struct ControlChannel {
    tx: mpsc::UnboundedSender<Envelope>,
    replies: PendingReplies,
}

impl ControlChannel {
    /// Create a channel handle and the receiving end for the writer task.
    pub fn new(replies: PendingReplies) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, replies }, rx)
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.tx.send(envelope).map_err(|_| ChannelError::Closed)
    }

    pub fn send_event<T: Serialize>(&self, kind: EventType, payload: &T) -> Result<(), ChannelError> {
        self.send(Envelope::from_payload(kind, payload)?)
    }

    /// Send `data` tagged with a fresh nonce and wait for the matching reply.
    ///
    /// Resolves to `None` when the window elapses or the channel is gone.
    /// Must not be awaited from inside a dispatch handler: replies are resolved
    /// by the same sequential loop that runs handlers.
    pub async fn request(
        &self,
        kind: EventType,
        data: serde_json::Value,
        timeout: Duration,
    ) -> Option<Envelope> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let reply = self.replies.register(nonce.clone());

        if let Err(e) = self.send(Envelope::new(kind, data).with_nonce(nonce.clone())) {
            tracing::warn!(%kind, error = %e, "Failed to send request");
            self.replies.cancel(&nonce);
            return None;
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(envelope)) => Some(envelope),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(%kind, %nonce, "Request timed out waiting for reply");
                self.replies.cancel(&nonce);
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain queued envelopes into the framed writer until every sender is dropped.
pub async fn run_writer<W>(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut writer: FramedWrite<W, EnvelopeCodec>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let kind = envelope.kind;
        if let Err(e) = writer.send(envelope).await {
            tracing::warn!(%kind, error = %e, "Failed to write envelope, closing outbound channel");
            return;
        }
    }
    tracing::trace!("Control channel writer exiting");
}
