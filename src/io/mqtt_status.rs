//! MQTT publisher for pass status changes
//!
//! Forwards every committed `StatusChange` to `{topic_prefix}/{entryCode}`
//! with QoS 1, so a guest app can subscribe to its own pass instead of
//! polling.

use crate::infra::config::Config;
use crate::services::notifier::StatusChange;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Topic a change is published to
pub fn status_topic(prefix: &str, change: &StatusChange) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), change.entry_code)
}

/// MQTT publisher actor
///
/// Receives status changes from the notifier and publishes them.
pub struct MqttStatusPublisher {
    client: AsyncClient,
    rx: broadcast::Receiver<StatusChange>,
    topic_prefix: String,
}

impl MqttStatusPublisher {
    /// Create a new publisher connected to the configured broker
    pub fn new(config: &Config, rx: broadcast::Receiver<StatusChange>) -> Self {
        let client_id = format!("gatepass-{}-{}", config.site_id(), std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_status_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_status_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_status_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.mqtt_topic_prefix().to_string() }
    }

    /// Run until shutdown or until the notifier goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.topic_prefix, "mqtt_status_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_status_shutdown");
                        // Drain remaining changes
                        while let Ok(change) = self.rx.try_recv() {
                            self.publish(&change).await;
                        }
                        return;
                    }
                }
                result = self.rx.recv() => {
                    match result {
                        Ok(change) => self.publish(&change).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = %skipped, "mqtt_status_lagged");
                        }
                        Err(RecvError::Closed) => {
                            info!("mqtt_status_source_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn publish(&self, change: &StatusChange) {
        let json = match serde_json::to_vec(change) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "mqtt_status_encode_failed");
                return;
            }
        };
        let topic = status_topic(&self.topic_prefix, change);
        // QoS 1 (at-least-once delivery)
        if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, false, json).await {
            error!(topic = %topic, error = %e, "mqtt_status_publish_failed");
        }
    }
}
