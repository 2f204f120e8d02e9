//! Adapter-wide lifecycle: inbound accept loop and coordinated shutdown.
//!
//! The coordinator owns the pieces no single session can: accepting inbound
//! channels from the primitive, admitting or rejecting them against the
//! attestation policy, and tearing everything down in order when the host
//! stops the adapter. Shutdown is drain-then-force: established sessions
//! get one close-drain window to flush pending frames, then anything still
//! open is closed unconditionally.

use crate::channel::{AttestationVerifier, ChannelProvider, SecureChannel};
use crate::endpoint::{fail_session, spawn_session_io, ExchangeSink};
use crate::events::EventBus;
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use futures::future::join_all;
use ironlink_core::{AdapterConfig, ConnectionDescriptor, IronlinkError};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Owns the accept loop and the shutdown sequence for one adapter instance.
pub struct LifecycleCoordinator {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn ChannelProvider>,
    verifier: Arc<dyn AttestationVerifier>,
    sink: Arc<dyn ExchangeSink>,
    config: AdapterConfig,
    events: EventBus,
    stop_tx: watch::Sender<bool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl LifecycleCoordinator {
    /// Create a coordinator; call [`start`](Self::start) to begin accepting
    pub fn new(
        registry: Arc<SessionRegistry>,
        provider: Arc<dyn ChannelProvider>,
        verifier: Arc<dyn AttestationVerifier>,
        sink: Arc<dyn ExchangeSink>,
        config: AdapterConfig,
        events: EventBus,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            provider,
            verifier,
            sink,
            config,
            events,
            stop_tx,
            accept_task: StdMutex::new(None),
        }
    }

    /// Spawn the inbound accept loop. Starting twice is a no-op.
    pub fn start(&self) {
        let Ok(mut task) = self.accept_task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }
        let loop_state = AcceptLoop {
            registry: Arc::clone(&self.registry),
            provider: Arc::clone(&self.provider),
            verifier: Arc::clone(&self.verifier),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            events: self.events.clone(),
            stop_rx: self.stop_tx.subscribe(),
        };
        *task = Some(tokio::spawn(loop_state.run()));
    }

    /// Stop accepting, drain every session, force-close stragglers.
    ///
    /// New acquires and sends are refused from the moment this is entered.
    /// Established sessions move to `Closing` and get
    /// `close_drain_timeout` to flush their pending outbound frames;
    /// handshaking sessions fail immediately. On return every session is
    /// `Closed` and released.
    pub async fn shutdown(&self) {
        info!("adapter shutdown initiated");
        self.registry.begin_shutdown();
        let _ = self.stop_tx.send(true);

        let accept_task = self.accept_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let sessions = self.registry.sessions().await;
        for session in &sessions {
            match session.state() {
                SessionState::Idle | SessionState::Handshaking => {
                    fail_session(
                        session,
                        IronlinkError::handshake("adapter shut down before establishment"),
                        &self.events,
                    );
                }
                SessionState::Established => {
                    session.begin_close();
                }
                SessionState::Closing | SessionState::Closed => {}
            }
        }

        let drains = sessions
            .iter()
            .map(|session| timeout(self.config.close_drain_timeout, session.wait_closed()));
        join_all(drains).await;

        for session in &sessions {
            if session.state() != SessionState::Closed {
                warn!(
                    descriptor = %session.descriptor(),
                    "session did not drain in time, forcing closed"
                );
                session.mark_closed();
            }
            self.registry.release(session.descriptor()).await;
        }
        info!(sessions = sessions.len(), "adapter shutdown complete");
    }
}

/// Everything the accept loop needs, detached from the coordinator so the
/// task owns its state.
struct AcceptLoop {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn ChannelProvider>,
    verifier: Arc<dyn AttestationVerifier>,
    sink: Arc<dyn ExchangeSink>,
    config: AdapterConfig,
    events: EventBus,
    stop_rx: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            let accepted = tokio::select! {
                stopped = self.stop_rx.wait_for(|stop| *stop) => {
                    let _ = stopped;
                    break;
                }
                accepted = self.provider.accept() => accepted,
            };

            match accepted {
                Ok((channel, descriptor)) => self.admit(channel, descriptor).await,
                Err(err) => {
                    warn!(error = %err, "accept loop stopping");
                    break;
                }
            }
        }
        debug!("accept loop exited");
    }

    /// Admit one inbound channel: attestation first, then a registry slot.
    async fn admit(&self, channel: Arc<dyn SecureChannel>, descriptor: ConnectionDescriptor) {
        let peer = channel.peer_identity();
        let evidence = channel.attestation_evidence();
        if !descriptor.remote_policy.admits(&peer) || !self.verifier.verify(&peer, &evidence) {
            warn!(
                descriptor = %descriptor,
                peer = %peer.id,
                "inbound peer rejected by attestation policy"
            );
            channel.close().await;
            return;
        }

        let (session, created) = match self.registry.acquire(&descriptor).await {
            Ok(acquired) => acquired,
            Err(err) => {
                debug!(descriptor = %descriptor, error = %err, "inbound channel refused");
                channel.close().await;
                return;
            }
        };
        if !created {
            // A live session already exists for this descriptor; one
            // session per descriptor, the newcomer loses.
            warn!(descriptor = %descriptor, "duplicate inbound channel rejected");
            channel.close().await;
            return;
        }

        match session.mark_established(peer.clone()) {
            Ok(()) => {
                self.events.emit(crate::events::SessionEvent::Established {
                    descriptor: descriptor.clone(),
                    peer,
                });
                info!(descriptor = %descriptor, "inbound session established");
                spawn_session_io(
                    session,
                    channel,
                    Arc::clone(&self.sink),
                    Arc::clone(&self.registry),
                    self.config.clone(),
                    self.events.clone(),
                );
            }
            Err(err) => {
                debug!(descriptor = %descriptor, error = %err, "inbound session lost to teardown");
                channel.close().await;
                self.registry.release(&descriptor).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AllowAllVerifier;
    use crate::endpoint::QueueSink;
    use crate::frame::Frame;
    use crate::memory::MemoryHub;
    use ironlink_core::{AttestationEvidence, Exchange};
    use std::time::Duration;
    use uuid::Uuid;

    fn coordinator_on(
        provider: Arc<dyn ChannelProvider>,
    ) -> (
        LifecycleCoordinator,
        Arc<SessionRegistry>,
        tokio::sync::mpsc::Receiver<(Exchange, ConnectionDescriptor)>,
    ) {
        let config = AdapterConfig::testing();
        let events = EventBus::default();
        let registry = Arc::new(SessionRegistry::new(config.clone(), events.clone()));
        let (sink, inbound_rx) = QueueSink::new(32);
        let coordinator = LifecycleCoordinator::new(
            Arc::clone(&registry),
            provider,
            Arc::new(AllowAllVerifier),
            Arc::new(sink),
            config,
            events,
        );
        (coordinator, registry, inbound_rx)
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_sink() {
        let hub = MemoryHub::new();
        let server = hub.register("addr-b", "ident-b", AttestationEvidence::empty());
        let client = hub.register("addr-a", "ident-a", AttestationEvidence::empty());
        let (coordinator, _registry, mut inbound_rx) = coordinator_on(Arc::new(server));
        coordinator.start();

        let channel = client
            .connect(&ConnectionDescriptor::new("ident-a", "addr-b"))
            .await
            .unwrap();
        let exchange = Exchange::new(b"inbound".to_vec()).with_header("k", "v");
        let frame = Frame::from_exchange(&exchange, 1, Uuid::new_v4());
        channel.send(frame.encode().unwrap()).await.unwrap();

        let (delivered, descriptor) = inbound_rx.recv().await.unwrap();
        assert_eq!(delivered.body, b"inbound");
        assert_eq!(delivered.headers.get("k"), Some(&"v".to_string()));
        assert_eq!(descriptor.remote_addr, "addr-a");
    }

    #[tokio::test]
    async fn inbound_peer_outside_allow_list_is_rejected() {
        let hub = MemoryHub::new();
        let server = hub.register("addr-b", "ident-b", AttestationEvidence::empty());
        let client = hub.register("addr-a", "ident-a", AttestationEvidence::empty());

        let config = AdapterConfig::testing();
        let events = EventBus::default();
        let registry = Arc::new(SessionRegistry::new(config.clone(), events.clone()));
        let (sink, _inbound_rx) = QueueSink::new(32);
        let verifier = crate::channel::ClaimVerifier::new("trust", "high");
        let coordinator = LifecycleCoordinator::new(
            Arc::clone(&registry),
            Arc::new(server),
            Arc::new(verifier),
            Arc::new(sink),
            config,
            events,
        );
        coordinator.start();

        // Client registered without the required claim: the coordinator
        // closes the channel, which the client sees as end of stream.
        let channel = client
            .connect(&ConnectionDescriptor::new("ident-a", "addr-b"))
            .await
            .unwrap();
        assert_eq!(channel.receive().await.unwrap(), None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_established_sessions_and_refuses_new_ones() {
        let hub = MemoryHub::new();
        let server = hub.register("addr-b", "ident-b", AttestationEvidence::empty());
        let client = hub.register("addr-a", "ident-a", AttestationEvidence::empty());
        let (coordinator, registry, _inbound_rx) = coordinator_on(Arc::new(server));
        coordinator.start();

        let channel = client
            .connect(&ConnectionDescriptor::new("ident-a", "addr-b"))
            .await
            .unwrap();

        // Wait until the accepted session shows up as established.
        let descriptor = loop {
            let sessions = registry.sessions().await;
            if let Some(session) = sessions
                .iter()
                .find(|s| s.state() == SessionState::Established)
            {
                break session.descriptor().clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(descriptor.remote_addr, "addr-a");

        coordinator.shutdown().await;
        assert!(registry.is_empty().await);
        assert!(registry.is_shutdown());

        // The peer observes the close frame, then end of stream.
        let bytes = channel.receive().await.unwrap().unwrap();
        let frame = Frame::decode(&bytes, 64 * 1024).unwrap();
        assert_eq!(frame.frame_type, crate::frame::FrameType::Close);
        assert_eq!(channel.receive().await.unwrap(), None);

        // No new sessions after shutdown.
        assert!(registry
            .acquire(&ConnectionDescriptor::new("x", "y"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn shutdown_fails_sessions_stuck_in_handshake() {
        let hub = MemoryHub::new();
        let server = hub.register("addr-b", "ident-b", AttestationEvidence::empty());
        let (coordinator, registry, _inbound_rx) = coordinator_on(Arc::new(server));
        coordinator.start();

        // A session parked in Handshaking with nobody driving it.
        let (session, created) = registry
            .acquire(&ConnectionDescriptor::new("me", "peer:slow"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(session.state(), SessionState::Handshaking);

        coordinator.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_matches::assert_matches!(
            session.failure(),
            Some(IronlinkError::HandshakeFailure { .. })
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_inbound_descriptor_is_rejected() {
        let hub = MemoryHub::new();
        let server = hub.register("addr-b", "ident-b", AttestationEvidence::empty());
        let client = hub.register("addr-a", "ident-a", AttestationEvidence::empty());
        let (coordinator, registry, mut inbound_rx) = coordinator_on(Arc::new(server));
        coordinator.start();

        let descriptor = ConnectionDescriptor::new("ident-a", "addr-b");
        let first = client.connect(&descriptor).await.unwrap();
        let second = client.connect(&descriptor).await.unwrap();

        // The second channel maps to the same session key and is refused.
        assert_eq!(second.receive().await.unwrap(), None);
        assert_eq!(registry.len().await, 1);

        // The first channel is still usable.
        let exchange = Exchange::new(b"still-alive".to_vec());
        let frame = Frame::from_exchange(&exchange, 1, Uuid::new_v4());
        first.send(frame.encode().unwrap()).await.unwrap();
        let (delivered, _) = inbound_rx.recv().await.unwrap();
        assert_eq!(delivered.body, b"still-alive");
    }
}
