//! The adapter facade: one object a routing host wires in and drives.
//!
//! Bundles the registry, the producer endpoint and the lifecycle
//! coordinator behind a builder, so a host configures the channel
//! primitive, the attestation verifier and the inbound sink once and then
//! only calls [`send`](SecureChannelAdapter::send) and
//! [`shutdown`](SecureChannelAdapter::shutdown).

use crate::channel::{AllowAllVerifier, AttestationVerifier, ChannelProvider};
use crate::coordinator::LifecycleCoordinator;
use crate::endpoint::{EndpointProducer, ExchangeSink};
use crate::events::{EventBus, SessionEvent};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStats};
use ironlink_core::{AdapterConfig, ConnectionDescriptor, Exchange, IronlinkError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Secure-session adapter instance.
///
/// Created through [`SecureChannelAdapter::builder`]. All methods take
/// `&self`; the adapter is shared freely across tasks.
pub struct SecureChannelAdapter {
    registry: Arc<SessionRegistry>,
    producer: EndpointProducer,
    coordinator: LifecycleCoordinator,
    events: EventBus,
}

impl std::fmt::Debug for SecureChannelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannelAdapter").finish_non_exhaustive()
    }
}

impl SecureChannelAdapter {
    /// Start building an adapter
    pub fn builder() -> AdapterBuilder {
        AdapterBuilder::default()
    }

    /// Begin accepting inbound channels
    pub fn start(&self) {
        self.coordinator.start();
    }

    /// Send one exchange to the peer identified by `descriptor`, creating
    /// and handshaking a session on first use. See
    /// [`EndpointProducer::send`] for the deadline contract.
    pub async fn send(
        &self,
        exchange: Exchange,
        descriptor: &ConnectionDescriptor,
        deadline: Option<Duration>,
    ) -> Result<()> {
        self.producer.send(exchange, descriptor, deadline).await
    }

    /// Send one exchange to an endpoint-URI of the form
    /// `secure://<addr>?identity=<id>[&allow=a,b]`.
    pub async fn send_to_uri(
        &self,
        exchange: Exchange,
        uri: &str,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let descriptor = ConnectionDescriptor::parse(uri)?;
        self.send(exchange, &descriptor, deadline).await
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of all live sessions
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry.sessions().await
    }

    /// Counters for the session under `descriptor`, if one exists
    pub async fn session_stats(&self, descriptor: &ConnectionDescriptor) -> Option<SessionStats> {
        self.registry.get(descriptor).await.map(|s| s.stats())
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.registry.is_shutdown()
    }

    /// Drain and close every session, then stop. Idempotent; sends are
    /// refused from the moment this is entered.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}

/// Builder for [`SecureChannelAdapter`].
#[derive(Default)]
pub struct AdapterBuilder {
    provider: Option<Arc<dyn ChannelProvider>>,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    sink: Option<Arc<dyn ExchangeSink>>,
    config: Option<AdapterConfig>,
}

impl AdapterBuilder {
    /// Channel primitive to dial and accept with. Required.
    pub fn provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attestation decision point. Defaults to admitting every peer that
    /// passes the descriptor's identity policy.
    pub fn verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Where inbound exchanges are delivered. Required.
    pub fn sink(mut self, sink: Arc<dyn ExchangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Adapter configuration. Defaults to [`AdapterConfig::default`].
    pub fn config(mut self, config: AdapterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate the configuration and assemble the adapter
    pub fn build(self) -> Result<SecureChannelAdapter> {
        let provider = self
            .provider
            .ok_or_else(|| IronlinkError::config("adapter requires a channel provider"))?;
        let sink = self
            .sink
            .ok_or_else(|| IronlinkError::config("adapter requires an exchange sink"))?;
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(AllowAllVerifier));
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let events = EventBus::default();
        let registry = Arc::new(SessionRegistry::new(config.clone(), events.clone()));
        let producer = EndpointProducer::new(
            Arc::clone(&registry),
            Arc::clone(&provider),
            Arc::clone(&verifier),
            Arc::clone(&sink),
            config.clone(),
            events.clone(),
        );
        let coordinator = LifecycleCoordinator::new(
            Arc::clone(&registry),
            provider,
            verifier,
            sink,
            config,
            events.clone(),
        );

        Ok(SecureChannelAdapter {
            registry,
            producer,
            coordinator,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::QueueSink;
    use crate::memory::MemoryHub;
    use assert_matches::assert_matches;
    use ironlink_core::AttestationEvidence;

    #[test]
    fn build_requires_provider_and_sink() {
        let err = SecureChannelAdapter::builder().build().unwrap_err();
        assert_matches!(err, IronlinkError::Config { .. });

        let hub = MemoryHub::new();
        let provider = hub.register("a", "ident-a", AttestationEvidence::empty());
        let err = SecureChannelAdapter::builder()
            .provider(Arc::new(provider))
            .build()
            .unwrap_err();
        assert_matches!(err, IronlinkError::Config { .. });
    }

    #[test]
    fn build_rejects_invalid_config() {
        let hub = MemoryHub::new();
        let provider = hub.register("a", "ident-a", AttestationEvidence::empty());
        let (sink, _rx) = QueueSink::new(8);

        let mut config = AdapterConfig::default();
        config.max_frame_size = 0;
        let err = SecureChannelAdapter::builder()
            .provider(Arc::new(provider))
            .sink(Arc::new(sink))
            .config(config)
            .build()
            .unwrap_err();
        assert_matches!(err, IronlinkError::Config { .. });
    }

    #[tokio::test]
    async fn two_adapters_exchange_messages_end_to_end() {
        let hub = MemoryHub::new();
        let provider_a = hub.register("addr-a", "ident-a", AttestationEvidence::empty());
        let provider_b = hub.register("addr-b", "ident-b", AttestationEvidence::empty());

        let (sink_a, _rx_a) = QueueSink::new(8);
        let adapter_a = SecureChannelAdapter::builder()
            .provider(Arc::new(provider_a))
            .sink(Arc::new(sink_a))
            .config(AdapterConfig::testing())
            .build()
            .unwrap();

        let (sink_b, mut rx_b) = QueueSink::new(8);
        let adapter_b = SecureChannelAdapter::builder()
            .provider(Arc::new(provider_b))
            .sink(Arc::new(sink_b))
            .config(AdapterConfig::testing())
            .build()
            .unwrap();
        adapter_b.start();

        adapter_a
            .send_to_uri(
                Exchange::new(b"hello".to_vec()).with_header("route", "inbox"),
                "secure://addr-b?identity=ident-a",
                None,
            )
            .await
            .unwrap();

        let (delivered, from) = rx_b.recv().await.unwrap();
        assert_eq!(delivered.body, b"hello");
        assert_eq!(delivered.headers.get("route"), Some(&"inbox".to_string()));
        assert_eq!(from.remote_addr, "addr-a");

        let descriptor = ConnectionDescriptor::parse("secure://addr-b?identity=ident-a").unwrap();
        let stats = adapter_a.session_stats(&descriptor).await.unwrap();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 5);

        adapter_a.shutdown().await;
        assert!(adapter_a.is_shutdown());
        assert_matches!(
            adapter_a
                .send(Exchange::new(b"late".to_vec()), &descriptor, None)
                .await
                .unwrap_err(),
            IronlinkError::Closed { .. }
        );
    }
}
