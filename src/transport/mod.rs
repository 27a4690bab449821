//! Transport abstraction over the two executor links: a broadcast
//! publish/subscribe channel for events and a request/reply channel for
//! command delivery.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryTransport;
pub use nats::NatsTransport;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("Subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("Request to {subject} failed: {reason}")]
    Request { subject: String, reason: String },
    #[error("Request to {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },
    #[error("No responder for {0}")]
    NoResponder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

pub type MessageStream = BoxStream<'static, TransportMessage>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget broadcast.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a subject pattern (`*` matches one token, `>` the rest).
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, TransportError>;

    /// Synchronous request/reply with a bounded timeout.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Re-establish both channels.
    async fn reconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// NATS-style subject matching.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(subject_matches("a.*.c", "a.x.c"));
        assert!(subject_matches("a.>", "a.b.c"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("a.*", "a.b.c"));
        assert!(!subject_matches("a.b", "a.c"));
    }
}
