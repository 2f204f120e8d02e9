//! Adapter configuration.
//!
//! Consumed from the routing engine's endpoint configuration mechanism.
//! All limits that bound allocation or blocking live here so a host can
//! tune them per endpoint.

use crate::error::{IronlinkError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Maximum accepted frame size in bytes (metadata + payload).
    /// Frames declaring more than this are rejected before the payload
    /// buffer is allocated.
    pub max_frame_size: usize,

    /// How long a handshake may stay in progress before it fails.
    pub handshake_timeout: Duration,

    /// How long a closing session may drain queued outbound frames before
    /// it is forced closed.
    pub close_drain_timeout: Duration,

    /// Depth of each session's pending-outbound queue. Producers block when
    /// the queue is full, giving backpressure towards the routing layer.
    pub send_queue_depth: usize,

    /// Maximum number of live sessions in the registry.
    pub max_sessions: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1024 * 1024, // 1MB
            handshake_timeout: Duration::from_secs(30),
            close_drain_timeout: Duration::from_secs(10),
            send_queue_depth: 64,
            max_sessions: 1000,
        }
    }
}

impl AdapterConfig {
    /// Create configuration for testing with short timeouts
    pub fn testing() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            handshake_timeout: Duration::from_millis(500),
            close_drain_timeout: Duration::from_millis(200),
            send_queue_depth: 8,
            max_sessions: 16,
        }
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(IronlinkError::config("max_frame_size must be greater than 0"));
        }
        if self.send_queue_depth == 0 {
            return Err(IronlinkError::config("send_queue_depth must be greater than 0"));
        }
        if self.max_sessions == 0 {
            return Err(IronlinkError::config("max_sessions must be greater than 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(IronlinkError::config("handshake_timeout must be greater than 0"));
        }
        if self.close_drain_timeout.is_zero() {
            return Err(IronlinkError::config(
                "close_drain_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}
