//! Peer identity, attestation policy and connection descriptors.
//!
//! A [`ConnectionDescriptor`] is the tuple that keys a session: which local
//! identity we speak as, which remote address we speak to, and what the
//! remote peer must prove about itself. Descriptors are immutable once a
//! session has been created from them.

use crate::error::{IronlinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Reference to an identity known to the connector (a key/certificate slot).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityRef(pub String);

impl IdentityRef {
    /// Create an identity reference from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity reference as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a peer proved during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Identity the peer authenticated as
    pub id: IdentityRef,
}

impl PeerIdentity {
    /// Create a peer identity
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: IdentityRef::new(id),
        }
    }
}

/// Attestation evidence presented by a peer during the handshake.
///
/// The adapter treats evidence as an opaque claim set; interpreting it is
/// the verifier's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationEvidence {
    /// Claims the peer asserts about its trust state
    pub claims: BTreeMap<String, String>,
}

impl AttestationEvidence {
    /// Evidence with no claims
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a claim to the evidence
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

/// Constraint on which remote identities a descriptor accepts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemoteIdentityPolicy {
    /// Accept any peer that completes the handshake
    AllowAny,
    /// Accept only peers on the list
    AllowList(BTreeSet<IdentityRef>),
}

impl RemoteIdentityPolicy {
    /// Build an allow-list policy from identity names
    pub fn allow_list<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllowList(ids.into_iter().map(IdentityRef::new).collect())
    }

    /// Whether the policy admits the given peer identity
    pub fn admits(&self, peer: &PeerIdentity) -> bool {
        match self {
            Self::AllowAny => true,
            Self::AllowList(allowed) => allowed.contains(&peer.id),
        }
    }
}

impl Default for RemoteIdentityPolicy {
    fn default() -> Self {
        Self::AllowAny
    }
}

/// Identifies a logical peer relationship: the registry key for sessions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Local identity to authenticate as
    pub local_identity: IdentityRef,
    /// Remote peer address (host:port or provider-specific form)
    pub remote_addr: String,
    /// Constraint on the remote peer's identity
    pub remote_policy: RemoteIdentityPolicy,
}

/// URI scheme accepted by [`ConnectionDescriptor::parse`].
pub const URI_SCHEME: &str = "secure://";

impl ConnectionDescriptor {
    /// Create a descriptor accepting any remote identity
    pub fn new(local_identity: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            local_identity: IdentityRef::new(local_identity),
            remote_addr: remote_addr.into(),
            remote_policy: RemoteIdentityPolicy::AllowAny,
        }
    }

    /// Attach a remote identity policy to the descriptor
    pub fn with_policy(mut self, policy: RemoteIdentityPolicy) -> Self {
        self.remote_policy = policy;
        self
    }

    /// Parse a descriptor from the routing engine's endpoint-URI form:
    ///
    /// `secure://<remote-addr>?identity=<local-id>[&allow=<id>,<id>,...]`
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| IronlinkError::config(format!("endpoint URI must start with {URI_SCHEME}: {uri}")))?;

        let (addr, query) = match rest.split_once('?') {
            Some((addr, query)) => (addr, Some(query)),
            None => (rest, None),
        };
        if addr.is_empty() {
            return Err(IronlinkError::config("endpoint URI has no remote address"));
        }

        let mut local_identity = None;
        let mut policy = RemoteIdentityPolicy::AllowAny;
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| IronlinkError::config(format!("malformed query parameter: {pair}")))?;
            match key {
                "identity" => local_identity = Some(value.to_string()),
                "allow" => {
                    policy = RemoteIdentityPolicy::allow_list(
                        value.split(',').filter(|id| !id.is_empty()),
                    );
                }
                other => {
                    return Err(IronlinkError::config(format!(
                        "unknown endpoint URI parameter: {other}"
                    )));
                }
            }
        }

        let local_identity = local_identity
            .ok_or_else(|| IronlinkError::config("endpoint URI is missing identity parameter"))?;

        Ok(Self {
            local_identity: IdentityRef::new(local_identity),
            remote_addr: addr.to_string(),
            remote_policy: policy,
        })
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=>{}", self.local_identity, self.remote_addr)
    }
}
