//! End-to-end tests of the adapter over the in-memory channel primitive.

use assert_matches::assert_matches;
use ironlink_core::{AdapterConfig, AttestationEvidence, ConnectionDescriptor, Exchange, IronlinkError};
use ironlink_transport::{
    ChannelProvider, Frame, FrameType, MemoryHub, QueueSink, SecureChannelAdapter, SessionEvent,
    SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

type InboundQueue = mpsc::Receiver<(Exchange, ConnectionDescriptor)>;

/// Route adapter tracing into the test harness, honoring RUST_LOG
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn adapter_at(
    hub: &Arc<MemoryHub>,
    addr: &str,
    identity: &str,
) -> (SecureChannelAdapter, InboundQueue) {
    init_tracing();
    let provider = hub.register(addr, identity, AttestationEvidence::empty());
    let (sink, rx) = QueueSink::new(32);
    let adapter = SecureChannelAdapter::builder()
        .provider(Arc::new(provider))
        .sink(Arc::new(sink))
        .config(AdapterConfig::testing())
        .build()
        .expect("adapter builds");
    (adapter, rx)
}

#[tokio::test]
async fn round_trip_and_reply_share_one_session() {
    let hub = MemoryHub::new();
    let (alpha, mut alpha_rx) = adapter_at(&hub, "addr-alpha", "alpha");
    let (beta, mut beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    alpha.start();
    beta.start();

    alpha
        .send_to_uri(
            Exchange::new(b"request".to_vec()).with_header("kind", "req"),
            "secure://addr-beta?identity=alpha",
            None,
        )
        .await
        .unwrap();

    let (request, from) = beta_rx.recv().await.unwrap();
    assert_eq!(request.body, b"request");
    assert_eq!(from.remote_addr, "addr-alpha");

    // The reply goes back over the session the request arrived on: the
    // inbound descriptor is a valid send target and maps to the same slot.
    beta.send(Exchange::new(b"reply".to_vec()), &from, None)
        .await
        .unwrap();
    let (reply, _) = alpha_rx.recv().await.unwrap();
    assert_eq!(reply.body, b"reply");
    assert_eq!(beta.sessions().await.len(), 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let hub = MemoryHub::new();
    let (alpha, _alpha_rx) = adapter_at(&hub, "addr-alpha", "alpha");
    let (beta, mut beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    beta.start();

    let descriptor = ConnectionDescriptor::new("alpha", "addr-beta");
    for i in 0..20u8 {
        alpha
            .send(Exchange::new(vec![i]), &descriptor, None)
            .await
            .unwrap();
    }

    for i in 0..20u8 {
        let (delivered, _) = beta_rx.recv().await.unwrap();
        assert_eq!(delivered.body, vec![i]);
    }

    let stats = alpha.session_stats(&descriptor).await.unwrap();
    assert_eq!(stats.frames_sent, 20);
}

#[tokio::test]
async fn concurrent_sends_share_one_session() {
    let hub = MemoryHub::new();
    let (alpha, _alpha_rx) = adapter_at(&hub, "addr-alpha", "alpha");
    let (beta, mut beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    beta.start();
    let alpha = Arc::new(alpha);

    let descriptor = ConnectionDescriptor::new("alpha", "addr-beta");
    let sends: Vec<_> = (0..8u8)
        .map(|i| {
            let alpha = Arc::clone(&alpha);
            let descriptor = descriptor.clone();
            tokio::spawn(async move { alpha.send(Exchange::new(vec![i]), &descriptor, None).await })
        })
        .collect();
    for send in sends {
        send.await.unwrap().unwrap();
    }

    assert_eq!(alpha.sessions().await.len(), 1);
    let stats = alpha.session_stats(&descriptor).await.unwrap();
    assert_eq!(stats.frames_sent, 8);

    let mut seen = Vec::new();
    for _ in 0..8 {
        let (delivered, _) = beta_rx.recv().await.unwrap();
        seen.push(delivered.body[0]);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<u8>>());
}

#[tokio::test]
async fn inbound_sequence_gap_faults_the_session() {
    let hub = MemoryHub::new();
    let (beta, _beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    let mut events = beta.subscribe();
    beta.start();

    // A raw peer that violates the gapless-sequence contract.
    let rogue = hub.register("addr-rogue", "rogue", AttestationEvidence::empty());
    let channel = rogue
        .connect(&ConnectionDescriptor::new("rogue", "addr-beta"))
        .await
        .unwrap();
    for seq in [1u64, 2, 4] {
        let frame = Frame::from_exchange(&Exchange::new(vec![0]), seq, Uuid::new_v4());
        channel.send(frame.encode().unwrap()).await.unwrap();
    }

    let error = loop {
        match events.recv().await.unwrap() {
            SessionEvent::Fault { error, .. } => break error,
            _ => continue,
        }
    };
    assert_matches!(
        error,
        IronlinkError::OrderingFault {
            expected: 3,
            actual: 4
        }
    );

    // The faulted session drains out: close frame, then end of stream.
    let bytes = channel.receive().await.unwrap().unwrap();
    assert_eq!(
        Frame::decode(&bytes, 64 * 1024).unwrap().frame_type,
        FrameType::Close
    );
    assert_eq!(channel.receive().await.unwrap(), None);

    beta.shutdown().await;
}

#[tokio::test]
async fn oversize_inbound_frame_faults_the_session() {
    let hub = MemoryHub::new();
    let (beta, _beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    let mut events = beta.subscribe();
    beta.start();

    let rogue = hub.register("addr-rogue", "rogue", AttestationEvidence::empty());
    let channel = rogue
        .connect(&ConnectionDescriptor::new("rogue", "addr-beta"))
        .await
        .unwrap();

    // Testing config caps frames at 64 KiB; this payload exceeds it.
    let frame = Frame::from_exchange(&Exchange::new(vec![0u8; 70_000]), 1, Uuid::new_v4());
    channel.send(frame.encode().unwrap()).await.unwrap();

    let error = loop {
        match events.recv().await.unwrap() {
            SessionEvent::Fault { error, .. } => break error,
            _ => continue,
        }
    };
    assert_matches!(error, IronlinkError::OversizeFrame { .. });

    beta.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_sessions_and_refuses_new_sends() {
    let hub = MemoryHub::new();
    let (alpha, _alpha_rx) = adapter_at(&hub, "addr-alpha", "alpha");
    let (beta, mut beta_rx) = adapter_at(&hub, "addr-beta", "beta");
    let (gamma, mut gamma_rx) = adapter_at(&hub, "addr-gamma", "gamma");
    let (delta, mut delta_rx) = adapter_at(&hub, "addr-delta", "delta");
    beta.start();
    gamma.start();
    delta.start();

    let to_beta = ConnectionDescriptor::new("alpha", "addr-beta");
    let to_gamma = ConnectionDescriptor::new("alpha", "addr-gamma");
    let to_delta = ConnectionDescriptor::new("alpha", "addr-delta");
    for _ in 0..5 {
        alpha
            .send(Exchange::new(b"msg".to_vec()), &to_beta, None)
            .await
            .unwrap();
    }
    alpha
        .send(Exchange::new(b"msg".to_vec()), &to_gamma, None)
        .await
        .unwrap();
    alpha
        .send(Exchange::new(b"msg".to_vec()), &to_delta, None)
        .await
        .unwrap();
    assert_eq!(alpha.sessions().await.len(), 3);

    alpha.shutdown().await;
    assert!(alpha.is_shutdown());
    assert!(alpha.sessions().await.is_empty());

    // Everything sent before shutdown was delivered.
    for _ in 0..5 {
        assert!(beta_rx.recv().await.is_some());
    }
    assert!(gamma_rx.recv().await.is_some());
    assert!(delta_rx.recv().await.is_some());

    assert_matches!(
        alpha
            .send(Exchange::new(b"late".to_vec()), &to_beta, None)
            .await
            .unwrap_err(),
        IronlinkError::Closed { .. }
    );

    beta.shutdown().await;
    gamma.shutdown().await;
    delta.shutdown().await;
}

#[tokio::test]
async fn send_deadline_on_unreachable_peer() {
    let hub = MemoryHub::new();
    let (alpha, _alpha_rx) = adapter_at(&hub, "addr-alpha", "alpha");

    // Nobody listens at this address; connect fails fast, so the error is
    // a handshake failure rather than a deadline expiry.
    let descriptor = ConnectionDescriptor::new("alpha", "addr-nowhere");
    let err = alpha
        .send(
            Exchange::new(b"x".to_vec()),
            &descriptor,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert_matches!(err, IronlinkError::HandshakeFailure { .. });

    // The failed session was torn down; a later attempt starts fresh.
    assert_eq!(
        alpha
            .sessions()
            .await
            .iter()
            .filter(|s| s.state() != SessionState::Closed)
            .count(),
        0
    );
}
