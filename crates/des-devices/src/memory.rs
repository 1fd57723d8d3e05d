//! In-memory transport (for testing and local runs without a broker).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{topic_matches, InboundMessage, Transport, TransportError};

/// Loopback transport recording every publication.
///
/// [`inject`](Self::inject) plays the role of a device publishing on the
/// broker: the message is delivered only if a subscription matches it.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    name: String,
    inbound: mpsc::Sender<InboundMessage>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    published: Arc<Mutex<Vec<InboundMessage>>>,
}

impl MemoryTransport {
    pub fn new(inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            name: "memory".to_string(),
            inbound,
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deliver a message as if a device published it.
    ///
    /// Returns `false` when no subscription matched.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        if !self.is_subscribed(topic) {
            return false;
        }
        self.inbound
            .send(InboundMessage::new(topic, payload))
            .await
            .is_ok()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    pub fn published(&self) -> Vec<InboundMessage> {
        self.published.lock().clone()
    }

    /// Publications on exactly `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<InboundMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let message = InboundMessage::new(topic, payload);
        self.published.lock().push(message.clone());
        // Broker loopback for our own subscriptions.
        if self.is_subscribed(topic) {
            self.inbound
                .send(message)
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().insert(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().remove(filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.subscriptions.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_requires_subscription() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = MemoryTransport::new(tx);

        assert!(!transport.inject("001/001/A/sig/state", b"{}".to_vec()).await);
        transport.subscribe("001/001/A/sig/+").await.unwrap();
        assert!(transport.inject("001/001/A/sig/state", b"{}".to_vec()).await);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "001/001/A/sig/state");
    }

    #[tokio::test]
    async fn test_publish_is_recorded() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = MemoryTransport::new(tx);
        transport
            .publish("001/001/A/cmd/start", b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(transport.published_on("001/001/A/cmd/start").len(), 1);
        assert!(transport.published_on("001/001/A/cmd/end").is_empty());
    }
}
