//! Session state machine and per-session accounting.
//!
//! A session owns one secure channel and everything scoped to it: the
//! monotonic lifecycle state, the negotiated peer identity, both sequence
//! counters and the pending-outbound queue. State fans out through a watch
//! channel so any number of callers can await establishment or teardown
//! and all of them observe the same outcome.
//!
//! The state machine is strictly monotonic:
//! `Idle → Handshaking → Established → Closing → Closed`. Nothing ever
//! re-enters `Handshaking`; reconnection means a new session under the same
//! descriptor once the old one is closed and released.

use ironlink_core::{ConnectionDescriptor, Exchange, IronlinkError, PeerIdentity, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Get current time as seconds since UNIX epoch
fn current_timestamp() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_secs()
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Descriptor known, no channel yet
    Idle,
    /// Primitive connect/accept in progress, attestation pending
    Handshaking,
    /// Bidirectional frame flow permitted
    Established,
    /// Close initiated, pending outbound frames still draining
    Closing,
    /// Terminal; channel released
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Handshaking => 1,
            Self::Established => 2,
            Self::Closing => 3,
            Self::Closed => 4,
        }
    }

    /// Whether the session can still make progress towards frame flow
    pub fn is_live(self) -> bool {
        matches!(self, Self::Handshaking | Self::Established)
    }
}

/// Counters tracked per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames submitted to the channel
    pub frames_sent: u64,
    /// Frames accepted from the channel
    pub frames_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
}

/// One outbound submission travelling from a producer to the session writer.
pub(crate) struct SendRequest {
    /// The exchange to encode and transmit
    pub exchange: Exchange,
    /// Correlation id assigned by the producer
    pub correlation_id: Uuid,
    /// Completion side: dropped by the caller on deadline expiry, which
    /// tells the writer to skip the request without burning a sequence
    /// number
    pub done: oneshot::Sender<Result<()>>,
}

/// One logical peer relationship with an (eventually) established channel.
pub struct Session {
    descriptor: ConnectionDescriptor,
    state_tx: watch::Sender<SessionState>,
    peer: OnceLock<PeerIdentity>,
    failure: StdMutex<Option<IronlinkError>>,
    fault_recorded: AtomicBool,
    send_seq: AtomicU64,
    recv_seq: AtomicU64,
    outbound_tx: mpsc::Sender<SendRequest>,
    outbound_rx: StdMutex<Option<mpsc::Receiver<SendRequest>>>,
    created_at: u64,
    last_activity: AtomicU64,
    stats: StdMutex<SessionStats>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .field("send_seq", &self.send_seq.load(Ordering::Relaxed))
            .field("recv_seq", &self.recv_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl Session {
    /// Create a session in `Idle` with a bounded outbound queue
    pub fn new(descriptor: ConnectionDescriptor, send_queue_depth: usize) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::channel(send_queue_depth);
        let now = current_timestamp();
        Self {
            descriptor,
            state_tx,
            peer: OnceLock::new(),
            failure: StdMutex::new(None),
            fault_recorded: AtomicBool::new(false),
            send_seq: AtomicU64::new(0),
            recv_seq: AtomicU64::new(0),
            outbound_tx,
            outbound_rx: StdMutex::new(Some(outbound_rx)),
            created_at: now,
            last_activity: AtomicU64::new(now),
            stats: StdMutex::new(SessionStats::default()),
        }
    }

    /// The descriptor this session was created from
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch the lifecycle state
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Identity the peer proved, once established
    pub fn peer(&self) -> Option<PeerIdentity> {
        self.peer.get().cloned()
    }

    /// The recorded session-fatal error, if any
    pub fn failure(&self) -> Option<IronlinkError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Seconds since UNIX epoch when the session was created
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Seconds since UNIX epoch of the last frame activity
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Move forward to `next` if the transition is monotonic and allowed
    /// from the current state. Returns whether the state changed.
    fn advance(&self, next: SessionState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if next.rank() > state.rank() {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(descriptor = %self.descriptor, state = ?next, "session state");
        }
        changed
    }

    /// Idle → Handshaking, on first acquire
    pub fn begin_handshake(&self) -> bool {
        self.state() == SessionState::Idle && self.advance(SessionState::Handshaking)
    }

    /// Handshaking → Established, on successful attestation and keying.
    ///
    /// Fails if the session already left `Handshaking` (for example a
    /// shutdown raced the handshake); the caller gets the recorded failure.
    pub fn mark_established(&self, peer: PeerIdentity) -> Result<()> {
        let _ = self.peer.set(peer.clone());
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Established;
                true
            } else {
                false
            }
        });
        if changed {
            info!(descriptor = %self.descriptor, peer = %peer.id, "session established");
            Ok(())
        } else {
            Err(self.failure_or_closed())
        }
    }

    /// Record a session-fatal error and move the state machine accordingly:
    /// Handshaking fails straight to `Closed`, an established session goes
    /// to `Closing` so the writer can drain, a closing session is forced
    /// `Closed`.
    ///
    /// Returns `true` only for the call that recorded the fault, so the
    /// caller can emit exactly one fault event per session failure.
    pub fn fail(&self, error: IronlinkError) -> bool {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(error.clone());
        }
        let target = match self.state() {
            SessionState::Idle | SessionState::Handshaking => SessionState::Closed,
            SessionState::Established => SessionState::Closing,
            SessionState::Closing => SessionState::Closed,
            SessionState::Closed => return false,
        };
        self.advance(target);
        let first = !self.fault_recorded.swap(true, Ordering::SeqCst);
        if first {
            warn!(descriptor = %self.descriptor, error = %error, "session fault");
        }
        first
    }

    /// Established → Closing, for a graceful local or remote close request
    pub fn begin_close(&self) -> bool {
        self.state() == SessionState::Established && self.advance(SessionState::Closing)
    }

    /// Force the terminal state. Idempotent.
    pub fn mark_closed(&self) {
        self.advance(SessionState::Closed);
    }

    fn failure_or_closed(&self) -> IronlinkError {
        self.failure()
            .unwrap_or_else(|| IronlinkError::closed(format!("session {} is closed", self.descriptor)))
    }

    /// Suspend until the session is `Established`, returning the peer
    /// identity, or fail with the session's recorded error. Every waiter
    /// observes the same outcome.
    pub async fn wait_established(&self) -> Result<PeerIdentity> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|state| state.rank() >= SessionState::Established.rank())
            .await
            .map_err(|_| IronlinkError::internal("session state channel dropped"))?;
        match state {
            SessionState::Established => self
                .peer()
                .ok_or_else(|| IronlinkError::internal("established session has no peer")),
            _ => Err(self.failure_or_closed()),
        }
    }

    /// Suspend until the session reaches `Closed`
    pub async fn wait_closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Assign the next outbound sequence number. Only the session writer
    /// calls this; numbers are strictly increasing and gapless because the
    /// writer assigns one per frame actually handed to the channel.
    pub fn next_send_seq(&self) -> u64 {
        self.send_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Highest assigned outbound sequence number
    pub fn send_seq(&self) -> u64 {
        self.send_seq.load(Ordering::Relaxed)
    }

    /// Validate an inbound sequence number against the expected-next value.
    /// Accepted numbers form a strictly increasing, gapless run from 1.
    pub fn accept_inbound_seq(&self, actual: u64) -> Result<()> {
        let expected = self.recv_seq.load(Ordering::Relaxed) + 1;
        if actual == expected {
            self.recv_seq.store(actual, Ordering::Relaxed);
            Ok(())
        } else {
            Err(IronlinkError::ordering(expected, actual))
        }
    }

    /// Last accepted inbound sequence number
    pub fn recv_seq(&self) -> u64 {
        self.recv_seq.load(Ordering::Relaxed)
    }

    /// Producer handle to the pending-outbound queue
    pub(crate) fn outbound(&self) -> mpsc::Sender<SendRequest> {
        self.outbound_tx.clone()
    }

    /// Take the writer side of the outbound queue; the session writer task
    /// claims it exactly once.
    pub(crate) fn take_outbound_rx(&self) -> Option<mpsc::Receiver<SendRequest>> {
        self.outbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Record a transmitted frame
    pub fn record_sent(&self, payload_bytes: usize) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.frames_sent += 1;
            stats.bytes_sent += payload_bytes as u64;
        }
        self.last_activity.store(current_timestamp(), Ordering::Relaxed);
    }

    /// Record an accepted inbound frame
    pub fn record_received(&self, payload_bytes: usize) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.frames_received += 1;
            stats.bytes_received += payload_bytes as u64;
        }
        self.last_activity.store(current_timestamp(), Ordering::Relaxed);
    }
}
