//! Downward contract to the secure channel primitive.
//!
//! The handshake algorithm, session keying and record encryption live in an
//! external library; the adapter talks to them through these traits. A
//! [`SecureChannel`] is one established, already-encrypted point-to-point
//! link; a [`ChannelProvider`] dials and accepts them; an
//! [`AttestationVerifier`] decides whether a peer's proved identity and
//! evidence are acceptable.

use async_trait::async_trait;
use ironlink_core::{
    AttestationEvidence, ConnectionDescriptor, PeerIdentity, RemoteIdentityPolicy, Result,
};
use std::sync::Arc;

/// One established secure channel: encrypted send/receive plus teardown.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Submit one frame's bytes for transmission. Completion means the
    /// primitive accepted the frame, not that the peer acknowledged it.
    async fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Receive the next frame's bytes. `None` means the peer released the
    /// channel.
    async fn receive(&self) -> Result<Option<Vec<u8>>>;

    /// Release the channel. Idempotent.
    async fn close(&self);

    /// Identity the peer proved during the handshake
    fn peer_identity(&self) -> PeerIdentity;

    /// Attestation evidence the peer presented during the handshake
    fn attestation_evidence(&self) -> AttestationEvidence;
}

/// Dials outbound channels and accepts inbound ones.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Establish an outbound channel to the descriptor's remote address,
    /// running the primitive's handshake.
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn SecureChannel>>;

    /// Wait for the next inbound channel. The returned descriptor carries
    /// the identities negotiated during the inbound handshake.
    async fn accept(&self) -> Result<(Arc<dyn SecureChannel>, ConnectionDescriptor)>;
}

/// Attestation decision point, invoked synchronously from the handshake.
///
/// Implementations must be side-effect free with respect to session data;
/// the only observable outcome of a verification is the session's state
/// transition.
pub trait AttestationVerifier: Send + Sync {
    /// Whether the peer's proved identity and presented evidence are
    /// acceptable.
    fn verify(&self, peer: &PeerIdentity, evidence: &AttestationEvidence) -> bool;
}

/// Verifier that admits every peer. Identity constraints still apply via
/// the descriptor's [`RemoteIdentityPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllVerifier;

impl AttestationVerifier for AllowAllVerifier {
    fn verify(&self, _peer: &PeerIdentity, _evidence: &AttestationEvidence) -> bool {
        true
    }
}

/// Verifier that requires a specific attestation claim to be present with
/// an exact value.
#[derive(Debug, Clone)]
pub struct ClaimVerifier {
    claim: String,
    expected: String,
}

impl ClaimVerifier {
    /// Require `claim` to equal `expected` in the peer's evidence
    pub fn new(claim: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
            expected: expected.into(),
        }
    }
}

impl AttestationVerifier for ClaimVerifier {
    fn verify(&self, _peer: &PeerIdentity, evidence: &AttestationEvidence) -> bool {
        evidence.claims.get(&self.claim) == Some(&self.expected)
    }
}

/// Combines an identity policy with an attestation verifier: the handshake
/// admits a peer only when both agree.
pub struct PolicyVerifier {
    policy: RemoteIdentityPolicy,
    inner: Arc<dyn AttestationVerifier>,
}

impl PolicyVerifier {
    /// Wrap a verifier with an identity policy
    pub fn new(policy: RemoteIdentityPolicy, inner: Arc<dyn AttestationVerifier>) -> Self {
        Self { policy, inner }
    }
}

impl AttestationVerifier for PolicyVerifier {
    fn verify(&self, peer: &PeerIdentity, evidence: &AttestationEvidence) -> bool {
        self.policy.admits(peer) && self.inner.verify(peer, evidence)
    }
}
