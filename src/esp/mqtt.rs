use std::sync::mpsc::{self, Receiver};
use std::thread;

use embedded_svc::mqtt::client::{EventPayload, QoS as EspQoS};
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration};
use log::{debug, warn};

use super::network_error;
use crate::error::NetworkError;
use crate::mqtt::{BrokerOptions, MqttConnector, MqttEvent, MqttTransport, QoS};

const EVENT_STACK_SIZE: usize = 6 * 1024;

fn esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
    }
}

/// Opens `esp-mqtt` sessions. The IDF client reconnects by itself.
#[derive(Default)]
pub struct EspMqttConnector;

pub struct EspMqttTransport {
    client: EspMqttClient<'static>,
}

impl MqttTransport for EspMqttTransport {
    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), NetworkError> {
        self.client
            .publish(topic, esp_qos(qos), retain, payload)
            .map(|_| ())
            .map_err(|e| network_error(topic, e))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), NetworkError> {
        self.client
            .subscribe(topic, esp_qos(qos))
            .map(|_| ())
            .map_err(|e| network_error(topic, e))
    }
}

impl MqttConnector for EspMqttConnector {
    type Transport = EspMqttTransport;

    fn connect(&mut self, options: &BrokerOptions) -> Result<(EspMqttTransport, Receiver<MqttEvent>), NetworkError> {
        let conf = MqttClientConfiguration {
            client_id: Some(&options.client_id),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
            keep_alive_interval: Some(options.keep_alive),
            network_timeout: options.network_timeout,
            lwt: Some(LwtConfiguration {
                topic: &options.last_will.topic,
                payload: &options.last_will.payload,
                qos: esp_qos(options.last_will.qos),
                retain: options.last_will.retain,
            }),
            ..Default::default()
        };

        let url = options.url();
        let (client, conn) = EspMqttClient::new(&url, &conf).map_err(|e| network_error(&url, e))?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("mqtt-events".into())
            .stack_size(EVENT_STACK_SIZE)
            .spawn(move || forward_events(conn, tx))
            .map_err(|e| NetworkError::LinkDown(format!("event thread: {}", e)))?;

        Ok((EspMqttTransport { client }, rx))
    }
}

// Runs until the client is dropped or the session's receiver goes away
fn forward_events(mut conn: EspMqttConnection, tx: mpsc::Sender<MqttEvent>) {
    while let Ok(event) = conn.next() {
        let event = match event.payload() {
            EventPayload::Connected(_) => MqttEvent::Connected,
            EventPayload::Disconnected => MqttEvent::Disconnected,
            EventPayload::Received { topic, data, .. } => match topic {
                Some(topic) => MqttEvent::Message {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                },
                None => {
                    warn!("MQTT: fragmented message ignored");
                    continue;
                }
            },
            EventPayload::Error(e) => {
                debug!("MQTT event error: {:?}", e);
                continue;
            }
            _ => continue,
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    debug!("MQTT event loop finished");
}
