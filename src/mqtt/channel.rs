// Persistent broker session: availability, discovery, telemetry and commands

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use log::{debug, info, warn};

use super::discovery::{self, DeviceDescriptor};
use super::{
    BrokerOptions, Command, LastWill, MqttConnector, MqttEvent, MqttTransport, QoS, Telemetry, Topics,
    CONNECT_TIMEOUT, KEEP_ALIVE, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};
use crate::config::MqttConfig;
use crate::error::NetworkError;

/// Static description of the channel, built from config.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub topics: Topics,
    pub device: DeviceDescriptor,
}

impl ChannelSettings {
    pub fn from_config(mqtt: &MqttConfig, firmware: &str) -> Self {
        let topics = Topics::new(&mqtt.prefix);
        Self {
            host: mqtt.host.clone(),
            port: mqtt.port,
            client_id: mqtt.client_id.clone(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            keep_alive: KEEP_ALIVE,
            connect_timeout: CONNECT_TIMEOUT,
            device: DeviceDescriptor::for_prefix(&topics.prefix, firmware),
            topics,
        }
    }

    fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            host: self.host.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: self.keep_alive,
            network_timeout: self.connect_timeout,
            last_will: LastWill {
                topic: self.topics.availability.clone(),
                payload: PAYLOAD_OFFLINE.as_bytes().to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            },
        }
    }
}

struct Session<T> {
    transport: T,
    events: Receiver<MqttEvent>,
    /// Broker link currently up
    online: bool,
    /// Subscription/availability/discovery must be (re)sent on the next Connected
    needs_announce: bool,
}

pub struct ControlChannel<C: MqttConnector> {
    connector: C,
    settings: ChannelSettings,
    session: Option<Session<C::Transport>>,
}

impl<C: MqttConnector> ControlChannel<C> {
    pub fn new(connector: C, settings: ChannelSettings) -> Self {
        Self {
            connector,
            settings,
            session: None,
        }
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// A session exists, possibly while its transport is reconnecting.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.online)
    }

    /// Open the session, wait for the broker, then subscribe and announce.
    pub fn connect(&mut self) -> Result<(), NetworkError> {
        self.session = None;

        let options = self.settings.broker_options();
        info!("MQTT: connecting to {} as {}", options.url(), options.client_id);
        let (transport, events) = self.connector.connect(&options)?;

        let timeout = self.settings.connect_timeout;
        match events.recv_timeout(timeout) {
            Ok(MqttEvent::Connected) => {}
            Ok(MqttEvent::Disconnected) => {
                return Err(NetworkError::Unreachable(format!("{} refused the session", options.url())))
            }
            Ok(other) => {
                return Err(NetworkError::Malformed(format!("unexpected event before connect: {:?}", other)))
            }
            Err(RecvTimeoutError::Timeout) => return Err(NetworkError::Timeout(timeout.as_millis() as u64)),
            Err(RecvTimeoutError::Disconnected) => return Err(NetworkError::Closed),
        }

        let mut session = Session {
            transport,
            events,
            online: true,
            needs_announce: false,
        };
        announce(&mut session.transport, &self.settings)?;
        self.session = Some(session);

        info!("MQTT connected to {}", options.url());
        Ok(())
    }

    /// Publish retained discovery documents for every entity.
    pub fn publish_discovery(&mut self) -> Result<(), NetworkError> {
        let session = self.session.as_mut().ok_or(NetworkError::Closed)?;
        publish_discovery(&mut session.transport, &self.settings.topics, &self.settings.device)
    }

    /// Fire-and-forget status publish: QoS 0, not retained, never retried.
    pub fn publish_telemetry(&mut self, telemetry: &Telemetry) -> Result<(), NetworkError> {
        let session = self.session.as_mut().ok_or(NetworkError::Closed)?;
        if !session.online {
            return Err(NetworkError::LinkDown("broker session reconnecting".into()));
        }
        let payload = telemetry
            .to_json()
            .map_err(|e| NetworkError::Malformed(e.to_string()))?;
        session
            .transport
            .publish(&self.settings.topics.status, QoS::AtMostOnce, false, payload.as_bytes())
    }

    /// Commands received since the last call. Ends when no more are pending;
    /// call again on the next tick.
    pub fn commands(&mut self) -> Commands<'_, C> {
        Commands { channel: self }
    }

    /// Announce `offline` and drop the session.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let topic = &self.settings.topics.availability;
            if let Err(e) = session
                .transport
                .publish(topic, QoS::AtLeastOnce, true, PAYLOAD_OFFLINE.as_bytes())
            {
                debug!("MQTT: offline announce failed: {}", e);
            }
        }
    }

    fn next_command(&mut self) -> Option<Command> {
        loop {
            let session = self.session.as_mut()?;
            let event = match session.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    warn!("MQTT: session closed");
                    self.session = None;
                    return None;
                }
            };

            match event {
                MqttEvent::Connected => {
                    session.online = true;
                    if session.needs_announce {
                        info!("MQTT: reconnected, re-announcing");
                        match announce(&mut session.transport, &self.settings) {
                            Ok(()) => session.needs_announce = false,
                            Err(e) => warn!("MQTT: re-announce failed: {}", e),
                        }
                    }
                }
                MqttEvent::Disconnected => {
                    warn!("MQTT: broker connection lost");
                    session.online = false;
                    session.needs_announce = true;
                }
                MqttEvent::Message { topic, payload } => {
                    if topic != self.settings.topics.cmd {
                        debug!("MQTT: ignoring message on {}", topic);
                        continue;
                    }
                    match Command::parse(&payload) {
                        Ok(command) => {
                            debug!("MQTT command: {}", command);
                            return Some(command);
                        }
                        Err(e) => warn!("MQTT command ignored: {} ({:?})", e, String::from_utf8_lossy(&payload)),
                    }
                }
            }
        }
    }
}

/// Iterator over pending commands. See [`ControlChannel::commands`].
pub struct Commands<'a, C: MqttConnector> {
    channel: &'a mut ControlChannel<C>,
}

impl<C: MqttConnector> Iterator for Commands<'_, C> {
    type Item = Command;

    fn next(&mut self) -> Option<Command> {
        self.channel.next_command()
    }
}

fn announce<T: MqttTransport>(transport: &mut T, settings: &ChannelSettings) -> Result<(), NetworkError> {
    let topics = &settings.topics;
    transport.subscribe(&topics.cmd, QoS::AtLeastOnce)?;
    transport.publish(&topics.availability, QoS::AtLeastOnce, true, PAYLOAD_ONLINE.as_bytes())?;
    publish_discovery(transport, topics, &settings.device)
}

fn publish_discovery<T: MqttTransport>(
    transport: &mut T,
    topics: &Topics,
    device: &DeviceDescriptor,
) -> Result<(), NetworkError> {
    let docs = discovery::documents(topics, device);
    for (topic, payload) in &docs {
        transport.publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())?;
    }
    debug!("MQTT: published {} discovery documents", docs.len());
    Ok(())
}
