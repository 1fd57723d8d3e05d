//! Live update feed.
//!
//! Every write to a device's latest-record cache is published here so that
//! external consumers (dashboards, attached clients) can follow a device
//! without polling. Delivery is best effort: a subscriber that falls behind
//! skips the oldest updates.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{
    AdminSettings, ConfigSettings, EventRecord, HeaderInfo, SampleRecord, StateSnapshot,
};

/// Default channel capacity for the live feed.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Latest-record kinds carried on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum LiveRecord {
    Admin(AdminSettings),
    State(StateSnapshot),
    Header(HeaderInfo),
    Config(ConfigSettings),
    Event(EventRecord),
    Sample(SampleRecord),
}

impl LiveRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            LiveRecord::Admin(_) => "admin",
            LiveRecord::State(_) => "state",
            LiveRecord::Header(_) => "header",
            LiveRecord::Config(_) => "config",
            LiveRecord::Event(_) => "event",
            LiveRecord::Sample(_) => "sample",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub serial: String,
    #[serde(flatten)]
    pub record: LiveRecord,
}

/// Broadcast feed of latest-record updates.
#[derive(Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<LiveUpdate>,
}

impl LiveFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an update. Returns `true` if at least one subscriber received it.
    pub fn publish(&self, serial: &str, record: LiveRecord) -> bool {
        self.tx
            .send(LiveUpdate {
                serial: serial.to_string(),
                record,
            })
            .is_ok()
    }

    /// Subscribe to updates for every device.
    pub fn subscribe(&self) -> LiveReceiver {
        LiveReceiver {
            rx: self.tx.subscribe(),
            serial: None,
        }
    }

    /// Subscribe to updates for one device.
    pub fn subscribe_device(&self, serial: impl Into<String>) -> LiveReceiver {
        LiveReceiver {
            rx: self.tx.subscribe(),
            serial: Some(serial.into()),
        }
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LiveReceiver {
    rx: broadcast::Receiver<LiveUpdate>,
    serial: Option<String>,
}

impl LiveReceiver {
    fn wants(&self, update: &LiveUpdate) -> bool {
        self.serial.as_deref().map_or(true, |s| s == update.serial)
    }

    /// Receive the next update.
    ///
    /// Returns `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) if self.wants(&update) => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Live feed subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<LiveUpdate> {
        loop {
            match self.rx.try_recv() {
                Ok(update) if self.wants(&update) => return Some(update),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;

    #[tokio::test]
    async fn test_device_filter() {
        let feed = LiveFeed::new();
        let mut all = feed.subscribe();
        let mut one = feed.subscribe_device("B");

        let state = StateSnapshot::defaults("A", Source::server(1));
        assert!(feed.publish("A", LiveRecord::State(state)));
        let header = HeaderInfo::defaults("B", Source::server(2));
        feed.publish("B", LiveRecord::Header(header));

        assert_eq!(all.recv().await.unwrap().serial, "A");
        assert_eq!(all.recv().await.unwrap().serial, "B");

        let update = one.recv().await.unwrap();
        assert_eq!(update.serial, "B");
        assert_eq!(update.record.kind(), "header");
        assert!(one.try_recv().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = LiveFeed::new();
        let sample = SampleRecord::default();
        assert!(!feed.publish("A", LiveRecord::Sample(sample)));
    }
}
