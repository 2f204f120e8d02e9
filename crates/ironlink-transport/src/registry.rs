//! Process-wide session registry, one per adapter instance.
//!
//! Maps connection descriptors to live sessions and enforces the at-most-one
//! rule: concurrent acquires for the same descriptor serialize under one
//! short-held lock so exactly one caller creates (and later handshakes) the
//! session; everyone else receives the same `Arc` and awaits the same
//! outcome through the session's state watch. No lock is ever held across
//! I/O.

use crate::events::{EventBus, SessionEvent};
use crate::session::{Session, SessionState};
use ironlink_core::{AdapterConfig, ConnectionDescriptor, IronlinkError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry of live sessions keyed by descriptor.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionDescriptor, Arc<Session>>>,
    config: AdapterConfig,
    events: EventBus,
    shutdown: AtomicBool,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(config: AdapterConfig, events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            events,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Whether shutdown has begun; acquires and sends are refused after
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Refuse all future acquires. Existing sessions keep draining.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        info!("session registry shutting down");
    }

    /// Return the live session for `descriptor`, or atomically create one.
    ///
    /// The boolean is `true` for exactly the caller that created the
    /// session; that caller owns initiating the handshake. A slot holding a
    /// `Closed` session that was not yet released is replaced, which is the
    /// reconnect path: a new session, never a revived one.
    pub async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(Arc<Session>, bool)> {
        if self.is_shutdown() {
            return Err(IronlinkError::closed("adapter is shutting down"));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(descriptor) {
            if existing.state() != SessionState::Closed {
                debug!(descriptor = %descriptor, state = ?existing.state(), "session reused");
                return Ok((Arc::clone(existing), false));
            }
        }

        if sessions.len() >= self.config.max_sessions
            && !sessions.contains_key(descriptor)
        {
            return Err(IronlinkError::transport(format!(
                "session registry at capacity: {} sessions",
                self.config.max_sessions
            )));
        }

        let session = Arc::new(Session::new(
            descriptor.clone(),
            self.config.send_queue_depth,
        ));
        session.begin_handshake();
        sessions.insert(descriptor.clone(), Arc::clone(&session));
        drop(sessions);

        info!(descriptor = %descriptor, "session created");
        self.events.emit(SessionEvent::Created {
            descriptor: descriptor.clone(),
        });
        Ok((session, true))
    }

    /// Look up a live session without creating one
    pub async fn get(&self, descriptor: &ConnectionDescriptor) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(descriptor)
            .filter(|s| s.state() != SessionState::Closed)
            .cloned()
    }

    /// Remove a session's slot once it reached `Closed`.
    ///
    /// Releasing a session that is not closed is refused; the slot must not
    /// be freed while the old session could still produce frames.
    pub async fn release(&self, descriptor: &ConnectionDescriptor) -> bool {
        let mut sessions = self.sessions.write().await;
        let removable = sessions
            .get(descriptor)
            .is_some_and(|s| s.state() == SessionState::Closed);
        if !removable {
            return false;
        }
        sessions.remove(descriptor);
        drop(sessions);

        debug!(descriptor = %descriptor, "session released");
        self.events.emit(SessionEvent::Closed {
            descriptor: descriptor.clone(),
        });
        true
    }

    /// Snapshot of all sessions currently in the registry
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ironlink_core::PeerIdentity;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(AdapterConfig::testing(), EventBus::default())
    }

    fn descriptor(addr: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new("me", addr)
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let registry = registry();
        let d = descriptor("peer:1");

        let (first, created) = registry.acquire(&d).await.unwrap();
        assert!(created);
        assert_eq!(first.state(), SessionState::Handshaking);

        let (second, created) = registry.acquire(&d).await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_acquires_create_exactly_one_session() {
        let registry = Arc::new(registry());
        let d = descriptor("peer:1");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let d = d.clone();
                tokio::spawn(async move { registry.acquire(&d).await })
            })
            .collect();

        let mut creators = 0;
        let mut sessions = Vec::new();
        for task in tasks {
            let (session, created) = task.await.unwrap().unwrap();
            creators += usize::from(created);
            sessions.push(session);
        }

        assert_eq!(creators, 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn closed_session_slot_is_replaced_on_acquire() {
        let registry = registry();
        let d = descriptor("peer:1");

        let (first, _) = registry.acquire(&d).await.unwrap();
        first.mark_closed();

        let (second, created) = registry.acquire(&d).await.unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Handshaking);
    }

    #[tokio::test]
    async fn release_only_removes_closed_sessions() {
        let registry = registry();
        let d = descriptor("peer:1");

        let (session, _) = registry.acquire(&d).await.unwrap();
        assert!(!registry.release(&d).await);

        session.mark_established(PeerIdentity::new("peer")).unwrap();
        assert!(!registry.release(&d).await);

        session.mark_closed();
        assert!(registry.release(&d).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let registry = registry(); // testing config: max 16 sessions
        for i in 0..16 {
            registry.acquire(&descriptor(&format!("peer:{i}"))).await.unwrap();
        }
        let err = registry.acquire(&descriptor("peer:overflow")).await.unwrap_err();
        assert_matches!(err, IronlinkError::Transport { .. });
    }

    #[tokio::test]
    async fn shutdown_refuses_new_acquires() {
        let registry = registry();
        registry.begin_shutdown();
        assert_matches!(
            registry.acquire(&descriptor("peer:1")).await.unwrap_err(),
            IronlinkError::Closed { .. }
        );
    }

    #[tokio::test]
    async fn events_are_emitted_for_create_and_release() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let registry = SessionRegistry::new(AdapterConfig::testing(), events);
        let d = descriptor("peer:1");

        let (session, _) = registry.acquire(&d).await.unwrap();
        session.mark_closed();
        registry.release(&d).await;

        assert_matches!(rx.recv().await.unwrap(), SessionEvent::Created { .. });
        assert_matches!(rx.recv().await.unwrap(), SessionEvent::Closed { .. });
    }
}
