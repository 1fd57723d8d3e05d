//! Pub/sub transport seam.
//!
//! A [`Transport`] publishes and manages subscriptions; inbound messages are
//! pushed into the `mpsc` channel handed to the transport at construction,
//! in the order the broker delivered them.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe failed on {filter}: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("Transport closed")]
    Closed,
}

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// MQTT filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("001/002/DEMO42/sig/+", "001/002/DEMO42/sig/state"));
        assert!(!topic_matches("001/002/DEMO42/sig/+", "001/002/DEMO42/cmd/state"));
        assert!(!topic_matches("001/002/DEMO42/sig/+", "001/002/DEMO42/sig/state/x"));
        assert!(topic_matches("des/#", "des/001/002/DEMO42/ping"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a"));
    }
}
