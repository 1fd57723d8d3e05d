//! Liveness Supervisor.
//!
//! One loop per connected device publishes the server's ping on the `des/`
//! namespace and stamps the server ping registry. Device-reported pings are
//! stamped into a second registry by the signal handler; the loop flags a
//! device as stale once no ping arrived within `stale_multiplier` periods.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use des_core::models::now_millis;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::PingMessage;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct PingMark {
    pub at: Instant,
    /// Unix millis.
    pub time: i64,
}

/// Timestamped alive markers keyed by serial.
#[derive(Debug, Default)]
pub struct PingRegistry {
    marks: DashMap<String, PingMark>,
}

impl PingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, serial: &str) {
        self.marks.insert(
            serial.to_string(),
            PingMark {
                at: Instant::now(),
                time: now_millis(),
            },
        );
    }

    pub fn last(&self, serial: &str) -> Option<PingMark> {
        self.marks.get(serial).map(|m| *m)
    }

    pub fn remove(&self, serial: &str) -> Option<PingMark> {
        self.marks.remove(serial).map(|(_, m)| m)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.marks.contains_key(serial)
    }

    /// No mark, or the last mark is older than `max_age`.
    pub fn is_stale(&self, serial: &str, max_age: Duration) -> bool {
        match self.last(serial) {
            Some(mark) => mark.at.elapsed() > max_age,
            None => true,
        }
    }

    pub fn stale(&self, max_age: Duration) -> Vec<String> {
        self.marks
            .iter()
            .filter(|m| m.at.elapsed() > max_age)
            .map(|m| m.key().clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    pub interval: Duration,
    pub device_period: Duration,
    pub stale_multiplier: u32,
}

impl LivenessSettings {
    pub fn from_config(config: &des_core::config::LivenessConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.server_ping_ms.max(1)),
            device_period: Duration::from_millis(u64::from(config.device_ping_ms.max(1))),
            stale_multiplier: config.stale_multiplier.max(1),
        }
    }

    pub fn device_stale_after(&self) -> Duration {
        self.device_period * self.stale_multiplier
    }
}

pub struct LivenessSupervisor {
    serial: String,
    topic: String,
    transport: Arc<dyn Transport>,
    server_pings: Arc<PingRegistry>,
    device_pings: Arc<PingRegistry>,
    settings: LivenessSettings,
    cancel: CancellationToken,
}

impl LivenessSupervisor {
    pub fn new(
        serial: impl Into<String>,
        topic: impl Into<String>,
        transport: Arc<dyn Transport>,
        server_pings: Arc<PingRegistry>,
        device_pings: Arc<PingRegistry>,
        settings: LivenessSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            serial: serial.into(),
            topic: topic.into(),
            transport,
            server_pings,
            device_pings,
            settings,
            cancel,
        }
    }

    /// Run until cancelled. The server ping entry is removed on exit.
    pub async fn run(self) {
        info!(
            serial = %self.serial,
            interval_ms = self.settings.interval.as_millis() as u64,
            "Liveness supervisor started"
        );
        // The device gets a full stale window from connect.
        if !self.device_pings.contains(&self.serial) {
            self.device_pings.mark(&self.serial);
        }
        let mut reported_stale = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.tick().await;

            let stale = self
                .device_pings
                .is_stale(&self.serial, self.settings.device_stale_after());
            if stale && !reported_stale {
                let last = self.device_pings.last(&self.serial).map(|m| m.time);
                warn!(serial = %self.serial, last_ping = ?last, "Device ping stale");
            } else if !stale && reported_stale {
                info!(serial = %self.serial, "Device ping recovered");
            }
            reported_stale = stale;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        self.server_pings.remove(&self.serial);
        info!(serial = %self.serial, "Liveness supervisor stopped");
    }

    async fn tick(&self) {
        let ping = PingMessage {
            serial: self.serial.clone(),
            time: now_millis(),
        };
        match serde_json::to_vec(&ping) {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(&self.topic, payload).await {
                    debug!(serial = %self.serial, error = %e, "Liveness publish failed");
                }
            }
            Err(e) => warn!(serial = %self.serial, error = %e, "Liveness encode failed"),
        }
        self.server_pings.mark(&self.serial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_registry_staleness() {
        let pings = PingRegistry::new();
        assert!(pings.is_stale("A", Duration::from_secs(60)));
        pings.mark("A");
        assert!(!pings.is_stale("A", Duration::from_secs(60)));
        assert!(pings.remove("A").is_some());
        assert!(!pings.contains("A"));
    }

    #[test]
    fn test_stale_window() {
        let settings = LivenessSettings::from_config(&des_core::config::LivenessConfig {
            server_ping_ms: 1000,
            device_ping_ms: 2000,
            stale_multiplier: 3,
        });
        assert_eq!(settings.device_stale_after(), Duration::from_secs(6));
    }
}
