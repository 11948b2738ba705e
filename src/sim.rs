//! In-memory backends for host builds.
//!
//! RAM-backed partitions, a scripted HTTP server, a loopback MQTT broker with
//! last-will handling and cycling sensors. Unit tests, `host-tests` and the
//! host build of the binary all run on these.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::debug;

use crate::config::ConfigStore;
use crate::display::{Display, DisplayView};
use crate::error::{FlashError, NetworkError};
use crate::mqtt::{BrokerOptions, LastWill, MqttConnector, MqttEvent, MqttTransport, QoS};
use crate::network::{BodyReader, HttpResponse, HttpTransport, Link};
use crate::ota::{FinalizedImage, PartitionId, PartitionInfo, PartitionStorage};
use crate::sensors::{BatteryMonitor, ClimateReading, ClimateSensor, Co2Sensor};
use crate::system::SystemControl;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Partitions

/// Every storage call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    Erase(PartitionId),
    Write { partition: PartitionId, offset: u64, len: usize },
    SetBoot(PartitionId),
    MarkValid(PartitionId),
    Restart,
}

struct RamPartition {
    info: PartitionInfo,
    data: Vec<u8>,
}

/// Factory plus two OTA slots held in RAM.
pub struct RamFlash {
    partitions: Vec<RamPartition>,
    running: PartitionId,
    boot: PartitionId,
    valid: bool,
    restarts: u32,
    boot_changes: u32,
    fail_erase: bool,
    fail_set_boot: bool,
    ops: Vec<FlashOp>,
}

impl RamFlash {
    pub fn new(running: PartitionId, slot_size: u64) -> Self {
        let partitions = [PartitionId::Factory, PartitionId::SlotA, PartitionId::SlotB]
            .into_iter()
            .map(|id| RamPartition {
                info: PartitionInfo { id, size: slot_size },
                data: Vec::new(),
            })
            .collect();
        Self {
            partitions,
            running,
            boot: running,
            valid: false,
            restarts: 0,
            boot_changes: 0,
            fail_erase: false,
            fail_set_boot: false,
            ops: Vec::new(),
        }
    }

    pub fn fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    pub fn fail_set_boot(&mut self, fail: bool) {
        self.fail_set_boot = fail;
    }

    pub fn contents(&self, id: PartitionId) -> &[u8] {
        self.partitions
            .iter()
            .find(|p| p.info.id == id)
            .map_or(&[][..], |p| p.data.as_slice())
    }

    pub fn is_erased(&self, id: PartitionId) -> bool {
        self.contents(id).is_empty()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn boot_changes(&self) -> u32 {
        self.boot_changes
    }

    pub fn running_marked_valid(&self) -> bool {
        self.valid
    }

    pub fn writes_to(&self, id: PartitionId) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Write { partition, .. } if *partition == id))
            .count()
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    fn slot_mut(&mut self, id: PartitionId) -> Result<&mut RamPartition, FlashError> {
        self.partitions
            .iter_mut()
            .find(|p| p.info.id == id)
            .ok_or_else(|| FlashError::Storage(format!("no partition {}", id)))
    }
}

impl PartitionStorage for RamFlash {
    fn list_partitions(&self) -> Vec<PartitionInfo> {
        self.partitions.iter().map(|p| p.info).collect()
    }

    fn running(&self) -> PartitionId {
        self.running
    }

    fn boot_target(&self) -> PartitionId {
        self.boot
    }

    fn erase(&mut self, partition: PartitionId) -> Result<(), FlashError> {
        self.ops.push(FlashOp::Erase(partition));
        if self.fail_erase {
            return Err(FlashError::Erase {
                partition,
                reason: "injected failure".into(),
            });
        }
        self.slot_mut(partition)?.data.clear();
        Ok(())
    }

    fn write(&mut self, partition: PartitionId, offset: u64, bytes: &[u8]) -> Result<(), FlashError> {
        self.ops.push(FlashOp::Write {
            partition,
            offset,
            len: bytes.len(),
        });
        let slot = self.slot_mut(partition)?;
        let end = offset as usize + bytes.len();
        if end as u64 > slot.info.size {
            return Err(FlashError::Write {
                partition,
                offset,
                reason: "past end of partition".into(),
            });
        }
        if slot.data.len() < end {
            slot.data.resize(end, 0xFF);
        }
        slot.data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_boot_target(&mut self, image: &FinalizedImage) -> Result<(), FlashError> {
        let partition = image.partition();
        self.ops.push(FlashOp::SetBoot(partition));
        if self.fail_set_boot {
            return Err(FlashError::SetBoot {
                partition,
                reason: "injected failure".into(),
            });
        }
        self.boot = partition;
        self.boot_changes += 1;
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<(), FlashError> {
        self.ops.push(FlashOp::MarkValid(self.running));
        self.valid = true;
        Ok(())
    }

    fn restart(&mut self) {
        self.ops.push(FlashOp::Restart);
        self.restarts += 1;
        self.running = self.boot;
        self.valid = false;
    }
}

// ---------------------------------------------------------------------------
// HTTP

/// Canned answer for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Body { body: Vec<u8>, declared: Option<u64> },
    /// Declares more bytes than it sends
    Truncated { declared: u64, body: Vec<u8> },
    /// Sends `after` bytes, then times out
    TimeoutAfter { body: Vec<u8>, after: usize },
    Status(u16),
    Fail(NetworkError),
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        let declared = Some(body.len() as u64);
        Reply::Body { body, declared }
    }

    /// Chunked transfer: no Content-Length.
    pub fn undeclared(body: Vec<u8>) -> Self {
        Reply::Body { body, declared: None }
    }
}

struct HttpInner {
    routes: HashMap<String, Reply>,
    requests: Vec<String>,
}

/// HTTP server answering from a route table. Clones share the table.
#[derive(Clone)]
pub struct ScriptedHttp {
    inner: Arc<Mutex<HttpInner>>,
    read_size: usize,
}

impl Default for ScriptedHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HttpInner {
                routes: HashMap::new(),
                requests: Vec::new(),
            })),
            // Deliberately not a divisor of the fetcher's chunk size
            read_size: 700,
        }
    }

    pub fn with(self, url: &str, reply: Reply) -> Self {
        self.set(url, reply);
        self
    }

    pub fn set(&self, url: &str, reply: Reply) {
        lock(&self.inner).routes.insert(url.to_string(), reply);
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.inner).requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.inner).requests.iter().filter(|r| *r == url).count()
    }
}

struct SimBody {
    data: Vec<u8>,
    pos: usize,
    read_size: usize,
    fail_at: Option<(usize, NetworkError)>,
}

impl BodyReader for SimBody {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        if let Some((at, err)) = &self.fail_at {
            if self.pos >= *at {
                return Err(err.clone());
            }
        }
        let limit = self.fail_at.as_ref().map_or(self.data.len(), |(at, _)| *at);
        let n = buf.len().min(self.read_size).min(limit - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl HttpTransport for ScriptedHttp {
    fn get<'a>(&'a mut self, url: &str, timeout: Duration) -> Result<HttpResponse<'a>, NetworkError> {
        let reply = {
            let mut inner = lock(&self.inner);
            inner.requests.push(url.to_string());
            inner.routes.get(url).cloned()
        };
        debug!("sim http: GET {} -> {:?}", url, reply.as_ref().map(reply_kind));

        let read_size = self.read_size;
        let body = |data: Vec<u8>, fail_at: Option<(usize, NetworkError)>| -> Box<dyn BodyReader + 'a> {
            Box::new(SimBody {
                data,
                pos: 0,
                read_size,
                fail_at,
            })
        };

        match reply {
            None => Ok(HttpResponse {
                status: 404,
                content_length: Some(0),
                body: body(Vec::new(), None),
            }),
            Some(Reply::Status(status)) => Ok(HttpResponse {
                status,
                content_length: Some(0),
                body: body(Vec::new(), None),
            }),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Body { body: data, declared }) => Ok(HttpResponse {
                status: 200,
                content_length: declared,
                body: body(data, None),
            }),
            Some(Reply::Truncated { declared, body: data }) => Ok(HttpResponse {
                status: 200,
                content_length: Some(declared),
                body: body(data, None),
            }),
            Some(Reply::TimeoutAfter { body: data, after }) => {
                let declared = data.len() as u64;
                let after = after.min(data.len());
                Ok(HttpResponse {
                    status: 200,
                    content_length: Some(declared),
                    body: body(data, Some((after, NetworkError::Timeout(timeout.as_millis() as u64)))),
                })
            }
        }
    }
}

fn reply_kind(reply: &Reply) -> &'static str {
    match reply {
        Reply::Body { .. } => "body",
        Reply::Truncated { .. } => "truncated",
        Reply::TimeoutAfter { .. } => "timeout",
        Reply::Status(_) => "status",
        Reply::Fail(_) => "fail",
    }
}

// ---------------------------------------------------------------------------
// Network link

#[derive(Clone)]
pub struct SimLink {
    up: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl SimLink {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Link for SimLink {
    fn ensure_up(&mut self) -> Result<(), NetworkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.is_up() {
            Ok(())
        } else {
            Err(NetworkError::LinkDown("simulated link down".into()))
        }
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MQTT

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub client: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

struct ClientSlot {
    events: Sender<MqttEvent>,
    will: LastWill,
    subscriptions: HashSet<String>,
    online: bool,
}

#[derive(Default)]
struct BrokerInner {
    reachable: bool,
    retained: HashMap<String, Vec<u8>>,
    publishes: Vec<Published>,
    clients: HashMap<String, ClientSlot>,
}

impl BrokerInner {
    fn publish(&mut self, message: Published) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained.insert(message.topic.clone(), message.payload.clone());
            }
        }
        for slot in self.clients.values() {
            if slot.online && slot.subscriptions.iter().any(|f| topic_matches(f, &message.topic)) {
                let _ = slot.events.send(MqttEvent::Message {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                });
            }
        }
        self.publishes.push(message);
    }

    fn fire_will(&mut self, client_id: &str) {
        if let Some(will) = self.clients.get(client_id).map(|s| s.will.clone()) {
            self.publish(Published {
                client: None,
                topic: will.topic,
                payload: will.payload,
                qos: will.qos,
                retain: will.retain,
            });
        }
    }
}

// `#` matches any remainder, `+` one level
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Single-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).reachable = reachable;
    }

    /// Publish from another client (e.g. the Home Assistant side).
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        lock(&self.inner).publish(Published {
            client: None,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
        });
    }

    /// Network drop: the broker fires the will and the client starts reconnecting.
    pub fn drop_client(&self, client_id: &str) {
        let mut inner = lock(&self.inner);
        inner.fire_will(client_id);
        if let Some(slot) = inner.clients.get_mut(client_id) {
            slot.online = false;
            slot.subscriptions.clear();
            let _ = slot.events.send(MqttEvent::Disconnected);
        }
    }

    /// The client's transport reconnected on its own.
    pub fn restore_client(&self, client_id: &str) {
        let mut inner = lock(&self.inner);
        if let Some(slot) = inner.clients.get_mut(client_id) {
            slot.online = true;
            let _ = slot.events.send(MqttEvent::Connected);
        }
    }

    /// The session is gone for good; its event stream ends.
    pub fn close_client(&self, client_id: &str) {
        let mut inner = lock(&self.inner);
        inner.fire_will(client_id);
        inner.clients.remove(client_id);
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.inner).retained.get(topic).cloned()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        lock(&self.inner)
            .clients
            .values()
            .any(|s| s.online && s.subscriptions.iter().any(|f| topic_matches(f, topic)))
    }

    pub fn last_will(&self, client_id: &str) -> Option<LastWill> {
        lock(&self.inner).clients.get(client_id).map(|s| s.will.clone())
    }

    pub fn published(&self, topic: &str) -> Vec<Published> {
        lock(&self.inner)
            .publishes
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }
}

pub struct LoopbackClient {
    broker: LoopbackBroker,
    client_id: String,
}

impl MqttTransport for LoopbackClient {
    fn publish(&mut self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> Result<(), NetworkError> {
        let mut inner = lock(&self.broker.inner);
        match inner.clients.get(&self.client_id) {
            Some(slot) if slot.online => {}
            Some(_) => return Err(NetworkError::LinkDown("broker connection lost".into())),
            None => return Err(NetworkError::Closed),
        }
        inner.publish(Published {
            client: Some(self.client_id.clone()),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), NetworkError> {
        let mut inner = lock(&self.broker.inner);
        let retained: Vec<(String, Vec<u8>)> = inner
            .retained
            .iter()
            .filter(|(t, _)| topic_matches(topic, t))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        let slot = match inner.clients.get_mut(&self.client_id) {
            Some(slot) if slot.online => slot,
            Some(_) => return Err(NetworkError::LinkDown("broker connection lost".into())),
            None => return Err(NetworkError::Closed),
        };
        slot.subscriptions.insert(topic.to_string());
        for (topic, payload) in retained {
            let _ = slot.events.send(MqttEvent::Message { topic, payload });
        }
        Ok(())
    }
}

impl MqttConnector for LoopbackBroker {
    type Transport = LoopbackClient;

    fn connect(&mut self, options: &BrokerOptions) -> Result<(LoopbackClient, Receiver<MqttEvent>), NetworkError> {
        let (tx, rx) = mpsc::channel();
        let mut inner = lock(&self.inner);
        if !inner.reachable {
            let _ = tx.send(MqttEvent::Disconnected);
        } else {
            let _ = tx.send(MqttEvent::Connected);
            inner.clients.insert(
                options.client_id.clone(),
                ClientSlot {
                    events: tx,
                    will: options.last_will.clone(),
                    subscriptions: HashSet::new(),
                    online: true,
                },
            );
        }
        Ok((
            LoopbackClient {
                broker: self.clone(),
                client_id: options.client_id.clone(),
            },
            rx,
        ))
    }
}

// ---------------------------------------------------------------------------
// Sensors, display, system

fn cycle<T: Copy>(values: &[Option<T>], index: &mut usize) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let value = values[*index % values.len()];
    *index += 1;
    value
}

#[derive(Debug, Default)]
struct Co2State {
    readings: Vec<Option<u16>>,
    next: usize,
    abc: Option<bool>,
    abc_writes: u32,
    calibrations: u32,
}

/// CO2 sensor cycling through scripted readings (`None` = failed read).
#[derive(Clone)]
pub struct SimCo2 {
    state: Arc<Mutex<Co2State>>,
}

impl SimCo2 {
    pub fn new(readings: Vec<Option<u16>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Co2State {
                readings,
                ..Default::default()
            })),
        }
    }

    pub fn abc(&self) -> Option<bool> {
        lock(&self.state).abc
    }

    pub fn abc_writes(&self) -> u32 {
        lock(&self.state).abc_writes
    }

    pub fn calibrations(&self) -> u32 {
        lock(&self.state).calibrations
    }
}

impl Co2Sensor for SimCo2 {
    fn read_latest(&mut self) -> Option<u16> {
        let mut s = lock(&self.state);
        let Co2State { readings, next, .. } = &mut *s;
        cycle(readings, next)
    }

    fn calibrate_zero(&mut self) -> Result<()> {
        lock(&self.state).calibrations += 1;
        Ok(())
    }

    fn set_abc(&mut self, enabled: bool) -> Result<()> {
        let mut s = lock(&self.state);
        s.abc = Some(enabled);
        s.abc_writes += 1;
        Ok(())
    }
}

pub struct SimClimate {
    readings: Vec<Option<ClimateReading>>,
    next: usize,
}

impl SimClimate {
    pub fn new(readings: Vec<Option<ClimateReading>>) -> Self {
        Self { readings, next: 0 }
    }
}

impl ClimateSensor for SimClimate {
    fn read_latest(&mut self) -> Option<ClimateReading> {
        cycle(&self.readings, &mut self.next)
    }
}

pub struct SimBattery {
    readings: Vec<Option<f32>>,
    next: usize,
}

impl SimBattery {
    pub fn new(readings: Vec<Option<f32>>) -> Self {
        Self { readings, next: 0 }
    }
}

impl BatteryMonitor for SimBattery {
    fn read_latest(&mut self) -> Option<f32> {
        cycle(&self.readings, &mut self.next)
    }
}

#[derive(Debug, Default)]
struct DisplayState {
    brightness: Option<u8>,
    renders: Vec<DisplayView>,
}

#[derive(Clone, Default)]
pub struct SimDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brightness(&self) -> Option<u8> {
        lock(&self.state).brightness
    }

    pub fn renders(&self) -> Vec<DisplayView> {
        lock(&self.state).renders.clone()
    }
}

impl Display for SimDisplay {
    fn set_brightness(&mut self, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(anyhow!("brightness {} out of range", percent));
        }
        lock(&self.state).brightness = Some(percent);
        Ok(())
    }

    fn render(&mut self, view: &DisplayView) -> Result<()> {
        lock(&self.state).renders.push(*view);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SimSystem {
    restarts: Arc<AtomicU32>,
}

impl SimSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl SystemControl for SimSystem {
    fn restart(&mut self) {
        debug!("sim: restart requested");
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Config storage

#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: &[u8]) -> Self {
        Self {
            blob: Arc::new(Mutex::new(Some(blob.to_vec()))),
        }
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        lock(&self.blob).clone()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.blob).clone())
    }

    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        *lock(&self.blob) = Some(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_filters() {
        assert!(topic_matches("c6-demo/cmd", "c6-demo/cmd"));
        assert!(topic_matches("c6-demo/#", "c6-demo/a/b"));
        assert!(topic_matches("+/cmd", "c6-demo/cmd"));
        assert!(!topic_matches("c6-demo/cmd", "c6-demo/cmd/x"));
        assert!(!topic_matches("c6-demo/+", "other/cmd"));
    }

    #[test]
    fn ram_flash_restart_follows_boot_pointer() {
        let mut flash = RamFlash::new(PartitionId::SlotA, 1024);
        flash.mark_running_valid().unwrap();
        assert!(flash.running_marked_valid());
        flash.restart();
        assert_eq!(flash.running(), PartitionId::SlotA);
        assert!(!flash.running_marked_valid());
        assert_eq!(flash.restarts(), 1);
    }

    #[test]
    fn http_body_times_out_midway() {
        let mut http = ScriptedHttp::new().with(
            "http://h/x",
            Reply::TimeoutAfter {
                body: vec![1; 2000],
                after: 1000,
            },
        );
        let mut response = http.get("http://h/x", Duration::from_secs(60)).unwrap();
        let mut buf = [0u8; 4096];
        let mut total = 0;
        let err = loop {
            match response.body.read(&mut buf) {
                Ok(n) => total += n,
                Err(e) => break e,
            }
        };
        assert_eq!(total, 1000);
        assert_eq!(err, NetworkError::Timeout(60_000));
    }
}
