use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;
use tokio_util::sync::CancellationToken;

use super::{NotificationEvent, NotificationSink};
use crate::config;
use crate::error::SinkError;
use crate::presence::TransitionKind;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage {
    name: String,
    #[serde(rename = "id")]
    mac_address: String,
    confidence: u8,
    retained: bool,
    manufacturer: Option<String>,
    ip: Option<String>,
    timestamp: String,
}

impl DeviceMqttMessage {
    fn from_event(event: &NotificationEvent) -> Self {
        DeviceMqttMessage {
            name: event.device.display_name(),
            mac_address: event.device.id.to_string(),
            confidence: match event.transition.kind {
                TransitionKind::Arrived => 100,
                TransitionKind::Departed => 0,
            },
            retained: false,
            manufacturer: event.device.vendor.clone(),
            ip: event.device.address.map(|a| a.to_string()),
            timestamp: event.at().to_rfc3339(),
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "wifinder".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "wifinder".to_string()),
            },
            eventloop,
        )
    }

    fn topic_for(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name)
        )
    }

    /// Drive the connection until cancelled or a disconnect has been sent.
    /// Publishes only go out while this is being polled.
    pub async fn event_loop(mut eventloop: rumqttc::EventLoop, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = eventloop.poll() => match polled {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::PubAck(_))) => {
                        debug!("Publish acknowledged");
                    }
                    Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        info!("Disconnected from MQTT broker");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error polling MQTT event loop: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
            }
        }
        debug!("MQTT event loop stopped");
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl NotificationSink for MqttClient {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), SinkError> {
        let message = DeviceMqttMessage::from_event(event);
        info!(
            "Announcing device {} (confidence: {}) on MQTT",
            message.name, message.confidence
        );
        let topic = self.topic_for(&message.name);
        self.client
            .publish(topic, QoS::AtMostOnce, false, serde_json::to_string(&message)?)
            .await?;
        Ok(())
    }
}

/// Topic segment for a display name: lower-cased, with every
/// non-alphanumeric character turned into `_`.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
