//! Routes inbound envelopes to their handlers.
//!
//! The table is built once at startup. Handlers run to completion, one
//! envelope at a time, with exclusive access to the [`WorkerState`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::codec::DecodeError;
use crate::bridge::protocol::{Envelope, EventType};
use crate::channel::{ChannelError, PendingReplies};
use crate::state::{StateError, WorkerState};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, state: &mut WorkerState, envelope: Envelope)
    -> Result<(), HandlerError>;
}

/// What happened to a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    /// Claimed by a pending request with the same nonce.
    Replied,
    /// No handler registered for this tag.
    Unhandled,
    /// The worker is terminating; nothing is processed any more.
    Ignored,
    /// The handler returned an error (already logged).
    Failed,
}

pub struct DispatchTable {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
    replies: PendingReplies,
}

impl DispatchTable {
    pub fn new(replies: PendingReplies) -> Self {
        Self {
            handlers: HashMap::new(),
            replies,
        }
    }

    pub fn with_handler(mut self, kind: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Install `handler` for `kind`, returning the one it replaced.
    pub fn register(
        &mut self,
        kind: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        self.handlers.insert(kind, handler)
    }

    pub fn unregister(&mut self, kind: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.remove(&kind)
    }

    pub fn is_registered(&self, kind: EventType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, state: &mut WorkerState, envelope: Envelope) -> Dispatched {
        let kind = envelope.kind;

        if let Some(reason) = state.termination_reason() {
            tracing::debug!(%kind, %reason, "Dropping envelope, manager is terminating");
            return Dispatched::Ignored;
        }

        let envelope = match self.replies.resolve(envelope) {
            Ok(()) => return Dispatched::Replied,
            Err(envelope) => envelope,
        };

        let Some(handler) = self.handlers.get(&kind) else {
            tracing::trace!(%kind, "No handler registered, dropping envelope");
            return Dispatched::Unhandled;
        };

        match handler.handle(state, envelope).await {
            Ok(()) => Dispatched::Handled,
            Err(e) => {
                tracing::error!(%kind, error = %e, "Handler failed");
                Dispatched::Failed
            }
        }
    }
}
