//! The routing engine's generic in-flight message unit.
//!
//! An [`Exchange`] is headers plus an opaque body, optionally carrying a
//! fault marker on the inbound path. The adapter reads outbound exchanges
//! and constructs inbound ones; it never interprets the body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Headers plus body, agnostic of transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    /// Metadata headers; insertion order is irrelevant
    pub headers: HashMap<String, String>,
    /// Opaque payload bytes
    pub body: Vec<u8>,
    /// Set when the exchange represents a failed delivery
    pub fault: Option<String>,
}

impl Exchange {
    /// Create an exchange with the given body and no headers
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
            fault: None,
        }
    }

    /// Add a header to the exchange
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Create a faulted exchange carrying an error description
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            headers: HashMap::new(),
            body: Vec::new(),
            fault: Some(message.into()),
        }
    }

    /// Whether this exchange carries a fault marker
    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_headers_and_body() {
        let exchange = Exchange::new(b"payload".to_vec())
            .with_header("content-type", "application/octet-stream")
            .with_header("trace-id", "abc");

        assert_eq!(exchange.body, b"payload");
        assert_eq!(exchange.headers.len(), 2);
        assert!(!exchange.is_fault());
    }

    #[test]
    fn fault_exchange_is_marked() {
        let exchange = Exchange::fault("session closed");
        assert!(exchange.is_fault());
        assert!(exchange.body.is_empty());
    }
}
