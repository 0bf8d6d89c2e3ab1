//! Per-connection protocol state shared between a transport and the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::TransportError;
use crate::mcp::message::{Message, RequestId};

/// Write side of a transport. Implementations serialise their own frames.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Delivers a message. `related` names the request the message belongs to.
    async fn send(&self, message: Message, related: Option<RequestId>) -> Result<(), TransportError>;

    /// The request was cancelled and will never see a terminal message.
    fn abandon(&self, _id: &RequestId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connected, `initialize` not seen yet.
    Created,
    /// `initialize` answered, waiting for `notifications/initialized`.
    Initialized,
    Ready,
    Closed,
}

/// One client as seen by the dispatcher. The scope keys the in-flight table,
/// so request ids only need to be unique per peer.
pub struct Peer {
    scope: Arc<str>,
    sink: Arc<dyn Outbound>,
    phase: Mutex<Phase>,
}

impl Peer {
    pub fn new(scope: impl Into<Arc<str>>, sink: Arc<dyn Outbound>) -> Self {
        Self {
            scope: scope.into(),
            sink,
            phase: Mutex::new(Phase::Created),
        }
    }

    pub fn scope(&self) -> &Arc<str> {
        &self.scope
    }

    pub fn sink(&self) -> Arc<dyn Outbound> {
        Arc::clone(&self.sink)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.phase(), Phase::Initialized | Phase::Ready)
    }

    /// Moves from `from` to `to`; returns false if the peer was elsewhere.
    pub fn transition(&self, from: Phase, to: Phase) -> bool {
        let mut phase = self.phase.lock();
        if *phase != from {
            return false;
        }
        *phase = to;
        true
    }

    pub fn close(&self) {
        *self.phase.lock() = Phase::Closed;
    }

    pub async fn send(&self, message: Message, related: Option<RequestId>) -> Result<(), TransportError> {
        self.sink.send(message, related).await
    }
}
