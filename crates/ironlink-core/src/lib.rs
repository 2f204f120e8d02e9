//! Shared foundation for the ironlink secure-channel adapter.
//!
//! Holds the types every other crate agrees on: the unified error type,
//! adapter configuration, peer identity and attestation policy, and the
//! routing engine's generic exchange representation. Nothing in this crate
//! performs I/O.

pub mod config;
pub mod error;
pub mod exchange;
pub mod identity;

pub use config::AdapterConfig;
pub use error::{IronlinkError, Result};
pub use exchange::Exchange;
pub use identity::{
    AttestationEvidence, ConnectionDescriptor, IdentityRef, PeerIdentity, RemoteIdentityPolicy,
};
