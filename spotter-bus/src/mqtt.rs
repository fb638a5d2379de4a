//! MQTT client: control subscription, detection publishing, last will

use crate::control::apply_control_message;
use crate::error::BusError;
use crate::message::DetectionMessage;
use rumqttc::{Client, ClientError, Connection, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use spotter_core::config::MqttConfig;
use spotter_core::{DetectionResult, ResultPublisher, RunState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Whether a result carries anything worth publishing
pub fn should_publish(result: &DetectionResult) -> bool {
    !result.is_empty() && result.source().is_available()
}

pub(crate) fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.address.clone(), config.port);
    options.set_keep_alive(config.keep_alive().max(Duration::from_secs(1)));
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    options.set_last_will(LastWill::new(
        config.topic_lastwill.clone(),
        config.last_will_message.clone(),
        QoS::AtLeastOnce,
        true,
    ));
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    options
}

/// Message bus connection.
///
/// Network I/O runs on a background thread whose only effect on the rest of
/// the process is writing the shared [`RunState`].
pub struct MqttBus {
    client: Client,
    topic_detection: String,
    retain: bool,
    location: String,
    stopping: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttBus {
    /// Connect and subscribe to the control topic.
    ///
    /// Blocks until the broker acknowledges the connection or the configured
    /// timeout elapses.
    pub fn connect(config: &MqttConfig, location: &str, state: RunState) -> Result<Self, BusError> {
        if config.client_id.is_empty() || config.client_id.starts_with(' ') {
            return Err(BusError::Connection(format!("invalid client id '{}'", config.client_id)));
        }

        let (client, connection) = Client::new(mqtt_options(config), REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let event_loop = {
            let client = client.clone();
            let stopping = Arc::clone(&stopping);
            let topic_state = config.topic_state.clone();
            std::thread::Builder::new()
                .name("mqtt-eventloop".to_string())
                .spawn(move || drive(connection, client, topic_state, state, stopping, ready_tx))?
        };

        let endpoint = format!("{}:{}", config.address, config.port);
        let outcome = match ready_rx.recv_timeout(config.connect_timeout()) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(BusError::Connection(format!("{}: {}", endpoint, reason))),
            Err(_) => Err(BusError::Connection(format!(
                "{}: no acknowledgement within {:?}",
                endpoint,
                config.connect_timeout()
            ))),
        };
        if let Err(e) = outcome {
            stopping.store(true, Ordering::Release);
            let _ = client.try_disconnect();
            return Err(e);
        }

        info!("Connected to MQTT broker {}", endpoint);
        Ok(Self {
            client,
            topic_detection: config.topic_detection.clone(),
            retain: config.retain,
            location: location.to_string(),
            stopping,
            event_loop: Some(event_loop),
        })
    }

    pub fn topic_detection(&self) -> &str {
        &self.topic_detection
    }

    /// Graceful disconnect; the last will is not sent.
    ///
    /// Never blocks on a full request queue. The event loop thread is then
    /// detached and exits on its next connection error.
    pub fn disconnect(&mut self) -> Result<(), BusError> {
        let Some(handle) = self.event_loop.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            return Err(BusError::Connection(format!("disconnect: {}", e)));
        }
        if handle.join().is_err() {
            warn!("MQTT event loop thread panicked");
        }
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

impl ResultPublisher for MqttBus {
    fn publish(&mut self, result: DetectionResult) -> spotter_core::Result<()> {
        if !should_publish(&result) {
            info!("Nothing detected");
            return Ok(());
        }

        let message = DetectionMessage::from_result(&result, &self.location)?;
        let payload = message.to_json()?;
        let size = payload.len();
        // a disconnected event loop stops draining the queue
        self.client
            .try_publish(self.topic_detection.clone(), QoS::AtLeastOnce, self.retain, payload)
            .map_err(|e| match e {
                ClientError::TryRequest(_) => {
                    BusError::Publish(format!("{}: queue full, detection dropped", self.topic_detection))
                }
                ClientError::Request(_) => BusError::Publish(format!("{}: {}", self.topic_detection, e)),
            })?;

        info!(
            "Published {} detection(s) to {} ({} bytes)",
            result.len(),
            self.topic_detection,
            size
        );
        Ok(())
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("MQTT disconnect on drop failed: {}", e);
        }
    }
}

fn drive(
    mut connection: Connection,
    client: Client,
    topic_state: String,
    state: RunState,
    stopping: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), String>>,
) {
    let mut connected = false;

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                // clean sessions drop subscriptions on every reconnect
                if let Err(e) = client.try_subscribe(topic_state.clone(), QoS::AtLeastOnce) {
                    error!("Subscribing to {} failed: {}", topic_state, e);
                }
                if !connected {
                    connected = true;
                    let _ = ready.send(Ok(()));
                } else {
                    info!("Reconnected to MQTT broker");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == topic_state {
                    let _ = apply_control_message(&state, &publish.payload);
                } else {
                    debug!("Ignoring message on {}", publish.topic);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if !connected {
                    let _ = ready.send(Err(e.to_string()));
                    break;
                }
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                warn!("MQTT connection error: {}, retrying", e);
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    debug!("MQTT event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use spotter_core::ImageSource;

    #[test]
    fn test_should_publish() {
        let inline = |labels: Vec<String>, confidences: Vec<f32>, bytes: &'static [u8]| {
            DetectionResult::new(labels, confidences, None, ImageSource::Inline(Bytes::from_static(bytes)))
                .unwrap()
        };
        assert!(should_publish(&inline(vec!["person".to_string()], vec![0.8], b"jpeg")));
        assert!(!should_publish(&inline(vec![], vec![], b"jpeg")));
        assert!(!should_publish(&inline(vec!["person".to_string()], vec![0.8], b"")));

        let missing = DetectionResult::new(
            vec!["person".to_string()],
            vec![0.8],
            None,
            ImageSource::File("/nonexistent/frame.png".into()),
        )
        .unwrap();
        assert!(!should_publish(&missing));
    }

    #[test]
    fn test_options_carry_retained_last_will() {
        let config = MqttConfig {
            username: Some("camera".to_string()),
            password: Some("secret".to_string()),
            keep_alive_secs: 0,
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config);

        let will = options.last_will().unwrap();
        assert_eq!(will.topic, config.topic_lastwill);
        assert_eq!(will.message, Bytes::from(config.last_will_message.clone()));
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);

        assert_eq!(
            options.credentials(),
            Some(("camera".to_string(), "secret".to_string()))
        );
        assert_eq!(options.keep_alive(), Duration::from_secs(1));
        assert_eq!(options.max_packet_size(), config.max_packet_size);
    }

    #[test]
    fn test_options_without_username_have_no_credentials() {
        let options = mqtt_options(&MqttConfig::default());
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_connect_refused_is_fatal() {
        let config = MqttConfig {
            address: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_secs: 5,
            ..MqttConfig::default()
        };
        let state = RunState::new();
        let result = MqttBus::connect(&config, "lab", state.clone());
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert!(!state.is_running());
    }

    #[test]
    fn test_connect_rejects_invalid_client_id() {
        let config = MqttConfig {
            client_id: String::new(),
            ..MqttConfig::default()
        };
        assert!(matches!(
            MqttBus::connect(&config, "lab", RunState::new()),
            Err(BusError::Connection(_))
        ));
    }
}
