//! In-memory secure channel for tests and simulation.
//!
//! A [`MemoryChannel`] pair behaves like an established, attested channel
//! without any network or cryptography underneath: the "handshake" is the
//! hub handing each side the identity and evidence the other registered.
//! Used by the integration tests and anywhere a deterministic transport is
//! needed.

use crate::channel::{ChannelProvider, SecureChannel};
use async_trait::async_trait;
use ironlink_core::{
    AttestationEvidence, ConnectionDescriptor, IdentityRef, IronlinkError, PeerIdentity, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Queue depth of each direction of a memory channel
const CHANNEL_DEPTH: usize = 64;

/// One side of an in-memory duplex channel.
pub struct MemoryChannel {
    tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    peer: PeerIdentity,
    evidence: AttestationEvidence,
}

impl MemoryChannel {
    /// Create a connected channel pair.
    ///
    /// `left_peer`/`left_evidence` are what the left side sees about its
    /// remote, and symmetrically for the right side.
    pub fn pair(
        left_peer: PeerIdentity,
        left_evidence: AttestationEvidence,
        right_peer: PeerIdentity,
        right_evidence: AttestationEvidence,
    ) -> (Arc<Self>, Arc<Self>) {
        let (left_tx, right_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (right_tx, left_rx) = mpsc::channel(CHANNEL_DEPTH);

        let left = Arc::new(Self {
            tx: StdMutex::new(Some(left_tx)),
            rx: Mutex::new(left_rx),
            peer: left_peer,
            evidence: left_evidence,
        });
        let right = Arc::new(Self {
            tx: StdMutex::new(Some(right_tx)),
            rx: Mutex::new(right_rx),
            peer: right_peer,
            evidence: right_evidence,
        });
        (left, right)
    }

    fn sender(&self) -> Result<mpsc::Sender<Vec<u8>>> {
        self.tx
            .lock()
            .map_err(|_| IronlinkError::internal("memory channel lock poisoned"))?
            .clone()
            .ok_or_else(|| IronlinkError::transport("memory channel is closed"))
    }
}

#[async_trait]
impl SecureChannel for MemoryChannel {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let sender = self.sender()?;
        sender
            .send(bytes)
            .await
            .map_err(|_| IronlinkError::transport("peer released the memory channel"))
    }

    async fn receive(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    fn peer_identity(&self) -> PeerIdentity {
        self.peer.clone()
    }

    fn attestation_evidence(&self) -> AttestationEvidence {
        self.evidence.clone()
    }
}

type Inbound = (Arc<dyn SecureChannel>, ConnectionDescriptor);

struct Registration {
    identity: IdentityRef,
    evidence: AttestationEvidence,
    inbox: mpsc::Sender<Inbound>,
}

/// Routes memory connections between providers by address.
#[derive(Default)]
pub struct MemoryHub {
    registrations: StdMutex<HashMap<String, Registration>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a provider at `addr`, presenting `identity` and `evidence`
    /// to peers that connect to it.
    pub fn register(
        self: &Arc<Self>,
        addr: impl Into<String>,
        identity: impl Into<String>,
        evidence: AttestationEvidence,
    ) -> MemoryProvider {
        let addr = addr.into();
        let identity = IdentityRef::new(identity);
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_DEPTH);

        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.insert(
                addr.clone(),
                Registration {
                    identity: identity.clone(),
                    evidence: evidence.clone(),
                    inbox: inbox_tx,
                },
            );
        }

        MemoryProvider {
            hub: Arc::clone(self),
            local_addr: addr,
            local_identity: identity,
            local_evidence: evidence,
            accept_rx: Mutex::new(inbox_rx),
        }
    }
}

/// Channel provider backed by a [`MemoryHub`].
pub struct MemoryProvider {
    hub: Arc<MemoryHub>,
    local_addr: String,
    local_identity: IdentityRef,
    local_evidence: AttestationEvidence,
    accept_rx: Mutex<mpsc::Receiver<Inbound>>,
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn SecureChannel>> {
        let (remote_identity, remote_evidence, inbox) = {
            let registrations = self
                .hub
                .registrations
                .lock()
                .map_err(|_| IronlinkError::internal("memory hub lock poisoned"))?;
            let registration = registrations.get(&descriptor.remote_addr).ok_or_else(|| {
                IronlinkError::transport(format!("peer unreachable: {}", descriptor.remote_addr))
            })?;
            (
                registration.identity.clone(),
                registration.evidence.clone(),
                registration.inbox.clone(),
            )
        };

        let (local_end, remote_end) = MemoryChannel::pair(
            PeerIdentity {
                id: remote_identity.clone(),
            },
            remote_evidence,
            PeerIdentity {
                id: descriptor.local_identity.clone(),
            },
            self.local_evidence.clone(),
        );

        // What the acceptor sees: its own identity speaking back to us.
        let mirrored = ConnectionDescriptor::new(remote_identity.as_str(), &self.local_addr);
        inbox
            .send((remote_end, mirrored))
            .await
            .map_err(|_| IronlinkError::transport("peer stopped accepting connections"))?;

        debug!(
            local = %self.local_identity,
            remote = %descriptor.remote_addr,
            "memory channel connected"
        );
        Ok(local_end)
    }

    async fn accept(&self) -> Result<Inbound> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| IronlinkError::transport("memory hub dropped the accept queue"))
    }
}
