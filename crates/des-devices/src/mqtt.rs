//! MQTT transport backed by rumqttc.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use des_core::config::MqttConfig;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::transport::{InboundMessage, Transport, TransportError};

/// Consecutive poll errors before the loop backs off longer.
const MAX_ERRORS: u32 = 5;

fn qos_from(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub struct MqttTransport {
    name: String,
    client: AsyncClient,
    qos: QoS,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl MqttTransport {
    /// Build the client and spawn its event loop.
    ///
    /// The loop stops when `cancel` fires or the inbound receiver is dropped.
    pub fn connect(
        config: &MqttConfig,
        inbound: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        if config.host.is_empty() {
            return Err(TransportError::Connection("empty broker host".to_string()));
        }
        let short = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", config.client_id_prefix, &short[..8]);

        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let qos = qos_from(config.qos);

        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            inbound,
            subscriptions.clone(),
            qos,
            cancel.clone(),
            client_id.clone(),
        ));

        info!(
            client_id = %client_id,
            broker = %format!("{}:{}", config.host, config.port),
            "MQTT transport started"
        );
        Ok(Self {
            name: client_id,
            client,
            qos,
            subscriptions,
            cancel,
        })
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: mpsc::Sender<InboundMessage>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    qos: QoS,
    cancel: CancellationToken,
    client_id: String,
) {
    let mut error_count = 0u32;
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            n = eventloop.poll() => n,
        };
        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                error_count = 0;
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if inbound.send(message).await.is_err() {
                    debug!(client_id = %client_id, "Inbound receiver dropped");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                error_count = 0;
                // Clean sessions drop subscriptions across reconnects.
                let filters: Vec<String> = subscriptions.lock().iter().cloned().collect();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                        warn!(client_id = %client_id, filter = %filter, error = %e, "Resubscribe failed");
                    }
                }
                info!(client_id = %client_id, "MQTT connected");
            }
            Ok(_) => {
                error_count = 0;
            }
            Err(e) => {
                error_count += 1;
                if error_count >= MAX_ERRORS {
                    error!(
                        client_id = %client_id,
                        errors = error_count,
                        error = %e,
                        "MQTT connection failing repeatedly"
                    );
                } else {
                    warn!(
                        client_id = %client_id,
                        errors = error_count,
                        error = %e,
                        "MQTT connection error"
                    );
                }
                let backoff = if error_count >= MAX_ERRORS { 5 } else { 1 };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                }
            }
        }
    }
    info!(client_id = %client_id, "MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        self.subscriptions.lock().insert(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().remove(filter);
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()));
        self.cancel.cancel();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_empty_host_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let config = MqttConfig {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            MqttTransport::connect(&config, tx, CancellationToken::new()),
            Err(TransportError::Connection(_))
        ));
    }
}
