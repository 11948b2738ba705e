//! MQTT control channel: telemetry out, commands in, retained availability.
//!
//! The broker client itself sits behind [`MqttConnector`] / [`MqttTransport`]
//! so the session logic runs the same against ESP-IDF and the loopback broker.

pub mod channel;
pub mod command;
pub mod discovery;
pub mod telemetry;

use std::sync::mpsc::Receiver;
use std::time::Duration;

pub use channel::{ChannelSettings, ControlChannel};
pub use command::Command;
pub use discovery::DeviceDescriptor;
pub use telemetry::Telemetry;

use crate::error::NetworkError;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Topics derived from the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub prefix: String,
    pub availability: String,
    pub status: String,
    pub cmd: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            prefix: prefix.to_string(),
            availability: format!("{}/availability", prefix),
            status: format!("{}/status", prefix),
            cmd: format!("{}/cmd", prefix),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a connector needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub network_timeout: Duration,
    pub last_will: LastWill,
}

impl BrokerOptions {
    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

/// Broker events, delivered in order on the receiver returned by `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

pub trait MqttTransport: Send {
    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), NetworkError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), NetworkError>;
}

/// Opens broker sessions. The transport reconnects on its own after a drop
/// and reports that as `Disconnected` followed by `Connected`; the receiver
/// closes only when the session is gone for good.
pub trait MqttConnector: Send {
    type Transport: MqttTransport;

    fn connect(&mut self, options: &BrokerOptions) -> Result<(Self::Transport, Receiver<MqttEvent>), NetworkError>;
}
