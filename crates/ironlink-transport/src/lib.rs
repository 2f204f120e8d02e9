//! Secure-channel endpoint adapter for a message-routing pipeline.
//!
//! Bridges a mutually-authenticated, attested transport primitive into the
//! routing engine's producer/consumer endpoint shape. The adapter owns the
//! session lifecycle (handshake, keyed establishment, drain, teardown), the
//! wire frame codec, and the backpressure boundary between the transport
//! and the routing layer. The handshake algorithm itself lives behind the
//! [`channel::SecureChannel`] trait.

pub mod adapter;
pub mod channel;
pub mod coordinator;
pub mod endpoint;
pub mod events;
pub mod frame;
pub mod memory;
pub mod registry;
pub mod session;

pub use adapter::{AdapterBuilder, SecureChannelAdapter};
pub use channel::{
    AllowAllVerifier, AttestationVerifier, ChannelProvider, ClaimVerifier, PolicyVerifier,
    SecureChannel,
};
pub use coordinator::LifecycleCoordinator;
pub use endpoint::{EndpointProducer, ExchangeSink, QueueSink};
pub use events::{EventBus, SessionEvent};
pub use frame::{Frame, FrameType};
pub use memory::{MemoryChannel, MemoryHub, MemoryProvider};
pub use registry::SessionRegistry;
pub use session::{Session, SessionState, SessionStats};
