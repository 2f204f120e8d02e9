//! Session lifecycle events for observability.
//!
//! The core only emits; formatting, storage and metrics are the host's
//! concern. Events are fanned out on a broadcast bus so any number of
//! subscribers (console, metrics pipeline, tests) can watch without
//! touching session state. Exactly one `Fault` is emitted per session
//! failure, no matter how many callers the failure affected.

use ironlink_core::{ConnectionDescriptor, IronlinkError, PeerIdentity};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default bus capacity; slow subscribers lag rather than block emitters
const DEFAULT_CAPACITY: usize = 256;

/// Something observable happened to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A session was created and entered handshaking
    Created {
        /// Descriptor the session was keyed by
        descriptor: ConnectionDescriptor,
    },
    /// A session completed its handshake
    Established {
        /// Descriptor the session was keyed by
        descriptor: ConnectionDescriptor,
        /// Identity the peer proved
        peer: PeerIdentity,
    },
    /// A session failed; emitted exactly once per session failure
    Fault {
        /// Descriptor the session was keyed by
        descriptor: ConnectionDescriptor,
        /// The session-fatal error
        error: IronlinkError,
    },
    /// A session reached Closed and its registry slot was released
    Closed {
        /// Descriptor the session was keyed by
        descriptor: ConnectionDescriptor,
    },
}

/// Broadcast bus for [`SessionEvent`]s, one per adapter instance.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with the given buffered capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Lossy when nobody subscribes; emitters never block.
    pub fn emit(&self, event: SessionEvent) {
        trace!(?event, "session event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
