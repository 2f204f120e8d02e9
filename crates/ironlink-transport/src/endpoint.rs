//! Producer/consumer bridge between the routing engine and sessions.
//!
//! The producer side accepts outbound exchanges, resolves a session through
//! the registry, suspends until it is established and hands the frame to
//! the session writer. The consumer side is one reader task per session
//! that decodes inbound frames, enforces sequence ordering and pushes
//! exchanges into the registered [`ExchangeSink`].
//!
//! Each session gets exactly one writer task and one reader task, which is
//! what keeps the sequence counters single-owner: the writer assigns send
//! numbers, the reader validates receive numbers, and nobody else touches
//! either.

use crate::channel::{AttestationVerifier, ChannelProvider, SecureChannel};
use crate::events::{EventBus, SessionEvent};
use crate::frame::{Frame, FrameType};
use crate::registry::SessionRegistry;
use crate::session::{SendRequest, Session, SessionState};
use async_trait::async_trait;
use ironlink_core::{AdapterConfig, ConnectionDescriptor, Exchange, IronlinkError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where inbound exchanges go: the upward contract to the routing engine.
#[async_trait]
pub trait ExchangeSink: Send + Sync {
    /// Deliver one inbound exchange decoded on the given session.
    /// An error is treated as an unrecoverable transport fault for the
    /// session that produced the exchange.
    async fn deliver(&self, exchange: Exchange, descriptor: &ConnectionDescriptor) -> Result<()>;
}

/// [`ExchangeSink`] backed by a bounded queue, for hosts that poll.
pub struct QueueSink {
    tx: mpsc::Sender<(Exchange, ConnectionDescriptor)>,
}

impl QueueSink {
    /// Create the sink and the receiving end of its queue
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<(Exchange, ConnectionDescriptor)>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ExchangeSink for QueueSink {
    async fn deliver(&self, exchange: Exchange, descriptor: &ConnectionDescriptor) -> Result<()> {
        self.tx
            .send((exchange, descriptor.clone()))
            .await
            .map_err(|_| IronlinkError::closed("exchange queue receiver dropped"))
    }
}

/// Producer endpoint: outbound exchanges in, frames out.
pub struct EndpointProducer {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn ChannelProvider>,
    verifier: Arc<dyn AttestationVerifier>,
    sink: Arc<dyn ExchangeSink>,
    config: AdapterConfig,
    events: EventBus,
}

impl EndpointProducer {
    /// Wire up a producer against shared adapter state
    pub fn new(
        registry: Arc<SessionRegistry>,
        provider: Arc<dyn ChannelProvider>,
        verifier: Arc<dyn AttestationVerifier>,
        sink: Arc<dyn ExchangeSink>,
        config: AdapterConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            provider,
            verifier,
            sink,
            config,
            events,
        }
    }

    /// Send one exchange over the session for `descriptor`.
    ///
    /// Suspends until the session is established, then until the channel
    /// primitive accepts the frame for transmission (at most once per
    /// attempt, never retried here). A `deadline` bounds the whole call;
    /// on expiry the attempt fails with `DeadlineExceeded` and the
    /// session's send counter is untouched, because the writer only
    /// assigns a sequence number to requests whose caller is still
    /// waiting.
    pub async fn send(
        &self,
        exchange: Exchange,
        descriptor: &ConnectionDescriptor,
        deadline: Option<Duration>,
    ) -> Result<()> {
        if self.registry.is_shutdown() {
            return Err(IronlinkError::closed("adapter is shutting down"));
        }
        let deadline_at = deadline.map(|d| Instant::now() + d);

        let (session, created) = self.registry.acquire(descriptor).await?;
        if created {
            self.spawn_handshake(Arc::clone(&session));
        }

        match deadline_at {
            Some(at) => timeout_at(at, session.wait_established())
                .await
                .map_err(|_| IronlinkError::deadline("send: waiting for session establishment"))??,
            None => session.wait_established().await?,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let request = SendRequest {
            exchange,
            correlation_id: Uuid::new_v4(),
            done: done_tx,
        };
        let outbound = session.outbound();
        let submit = async move {
            outbound
                .send(request)
                .await
                .map_err(|_| IronlinkError::closed("session writer stopped"))?;
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(session
                    .failure()
                    .unwrap_or_else(|| IronlinkError::closed("session closed before send completed"))),
            }
        };
        match deadline_at {
            Some(at) => timeout_at(at, submit)
                .await
                .map_err(|_| IronlinkError::deadline("send: frame submission"))?,
            None => submit.await,
        }
    }

    /// Run the outbound handshake for a freshly created session. Called by
    /// exactly the acquire winner; everyone else waits on the state watch.
    fn spawn_handshake(&self, session: Arc<Session>) {
        let provider = Arc::clone(&self.provider);
        let verifier = Arc::clone(&self.verifier);
        let sink = Arc::clone(&self.sink);
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let descriptor = session.descriptor().clone();
            let connected = match timeout(config.handshake_timeout, provider.connect(&descriptor)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(err)) => Err(IronlinkError::handshake(err.to_string())),
                Err(_) => Err(IronlinkError::handshake(format!(
                    "handshake timed out after {:?}",
                    config.handshake_timeout
                ))),
            };

            let channel = match connected {
                Ok(channel) => channel,
                Err(err) => {
                    fail_session(&session, err, &events);
                    registry.release(&descriptor).await;
                    return;
                }
            };

            let peer = channel.peer_identity();
            let evidence = channel.attestation_evidence();
            if !descriptor.remote_policy.admits(&peer) || !verifier.verify(&peer, &evidence) {
                let err = IronlinkError::handshake(format!(
                    "peer {} rejected by attestation policy",
                    peer.id
                ));
                fail_session(&session, err, &events);
                channel.close().await;
                registry.release(&descriptor).await;
                return;
            }

            match session.mark_established(peer.clone()) {
                Ok(()) => {
                    events.emit(SessionEvent::Established {
                        descriptor,
                        peer,
                    });
                    spawn_session_io(session, channel, sink, registry, config, events);
                }
                Err(err) => {
                    // Shutdown raced the handshake; the session is already
                    // closed with its own failure recorded.
                    debug!(descriptor = %descriptor, error = %err, "handshake lost to teardown");
                    channel.close().await;
                    registry.release(&descriptor).await;
                }
            }
        });
    }
}

/// Record a session-fatal error and emit its single fault event.
pub(crate) fn fail_session(session: &Session, error: IronlinkError, events: &EventBus) {
    if session.fail(error.clone()) {
        events.emit(SessionEvent::Fault {
            descriptor: session.descriptor().clone(),
            error,
        });
    }
}

/// Start the writer and reader tasks for an established session.
pub(crate) fn spawn_session_io(
    session: Arc<Session>,
    channel: Arc<dyn SecureChannel>,
    sink: Arc<dyn ExchangeSink>,
    registry: Arc<SessionRegistry>,
    config: AdapterConfig,
    events: EventBus,
) {
    let Some(outbound_rx) = session.take_outbound_rx() else {
        warn!(descriptor = %session.descriptor(), "session io already running");
        return;
    };
    tokio::spawn(writer_loop(
        Arc::clone(&session),
        Arc::clone(&channel),
        outbound_rx,
        registry,
        config.clone(),
        events.clone(),
    ));
    tokio::spawn(reader_loop(session, channel, sink, config, events));
}

/// Writer task: sole owner of the send counter and the channel's send side.
/// Exits through the drain path once the session starts closing, then
/// releases the registry slot.
async fn writer_loop(
    session: Arc<Session>,
    channel: Arc<dyn SecureChannel>,
    mut outbound_rx: mpsc::Receiver<SendRequest>,
    registry: Arc<SessionRegistry>,
    config: AdapterConfig,
    events: EventBus,
) {
    let mut state_rx = session.subscribe();
    loop {
        tokio::select! {
            request = outbound_rx.recv() => match request {
                Some(request) => {
                    if !handle_send(&session, channel.as_ref(), request, &events).await {
                        break;
                    }
                }
                None => break,
            },
            changed = async {
                state_rx
                    .wait_for(|s| !matches!(s, SessionState::Established))
                    .await
                    .map(|_| ())
            } => {
                let _ = changed;
                break;
            }
        }
    }

    if session.state() == SessionState::Closing {
        let drain = async {
            while let Ok(request) = outbound_rx.try_recv() {
                if !handle_send(&session, channel.as_ref(), request, &events).await {
                    return;
                }
            }
            // Tell the peer we are done before releasing the channel.
            if let Ok(bytes) = Frame::close(session.next_send_seq()).encode() {
                let _ = channel.send(bytes).await;
            }
        };
        if timeout(config.close_drain_timeout, drain).await.is_err() {
            warn!(
                descriptor = %session.descriptor(),
                timeout = ?config.close_drain_timeout,
                "close drain timed out, forcing session closed"
            );
        }
    }

    channel.close().await;
    session.mark_closed();
    registry.release(session.descriptor()).await;
}

/// Process one outbound request. Returns `false` when the session can no
/// longer transmit.
async fn handle_send(
    session: &Session,
    channel: &dyn SecureChannel,
    request: SendRequest,
    events: &EventBus,
) -> bool {
    // Caller gave up (deadline expired) before we picked the request up:
    // drop it without assigning a sequence number.
    if request.done.is_closed() {
        return true;
    }
    if session.state() == SessionState::Closed {
        let _ = request.done.send(Err(session
            .failure()
            .unwrap_or_else(|| IronlinkError::closed("session is closed"))));
        return false;
    }

    let sequence = session.next_send_seq();
    let frame = Frame::from_exchange(&request.exchange, sequence, request.correlation_id);
    let payload_len = request.exchange.body.len();
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = request.done.send(Err(err));
            return true;
        }
    };

    match channel.send(bytes).await {
        Ok(()) => {
            session.record_sent(payload_len);
            let _ = request.done.send(Ok(()));
            true
        }
        Err(err) => {
            fail_session(session, err.clone(), events);
            let _ = request.done.send(Err(err));
            false
        }
    }
}

/// What an accepted inbound frame asked for
enum Inbound {
    Delivered,
    CloseRequested,
}

/// Reader task: sole owner of the receive counter. Any decode rejection is
/// fatal to the session; there is no partial recovery of a corrupted
/// stream.
async fn reader_loop(
    session: Arc<Session>,
    channel: Arc<dyn SecureChannel>,
    sink: Arc<dyn ExchangeSink>,
    config: AdapterConfig,
    events: EventBus,
) {
    let mut state_rx = session.subscribe();
    loop {
        let received = tokio::select! {
            changed = state_rx.wait_for(|s| matches!(s, SessionState::Closing | SessionState::Closed)) => {
                let _ = changed;
                break;
            }
            received = channel.receive() => received,
        };

        match received {
            Ok(Some(bytes)) => {
                match process_frame(&session, sink.as_ref(), &bytes, config.max_frame_size).await {
                    Ok(Inbound::Delivered) => {}
                    Ok(Inbound::CloseRequested) => {
                        debug!(descriptor = %session.descriptor(), "close frame received");
                        session.begin_close();
                        break;
                    }
                    Err(err) => {
                        fail_session(&session, err, &events);
                        break;
                    }
                }
            }
            Ok(None) => {
                // End of stream without a close frame is an abrupt
                // termination, not a graceful one.
                if session.state() == SessionState::Established {
                    fail_session(
                        &session,
                        IronlinkError::transport("peer released the channel without closing"),
                        &events,
                    );
                }
                break;
            }
            Err(err) => {
                fail_session(&session, err, &events);
                break;
            }
        }
    }
}

async fn process_frame(
    session: &Session,
    sink: &dyn ExchangeSink,
    bytes: &[u8],
    max_frame_size: usize,
) -> Result<Inbound> {
    let frame = Frame::decode(bytes, max_frame_size)?;
    session.accept_inbound_seq(frame.sequence)?;
    match frame.frame_type {
        FrameType::Close => Ok(Inbound::CloseRequested),
        FrameType::Control => {
            // Reserved for adapter-internal signalling; sequence-counted
            // but not delivered upward.
            session.record_received(0);
            Ok(Inbound::Delivered)
        }
        FrameType::Data => {
            session.record_received(frame.payload.len());
            let exchange = frame.into_exchange();
            sink.deliver(exchange, session.descriptor())
                .await
                .map_err(|err| IronlinkError::transport(format!("inbound delivery failed: {err}")))?;
            Ok(Inbound::Delivered)
        }
    }
}
