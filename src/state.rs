// State shared between the sensing loop and the network worker
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use heapless::Deque;
use log::warn;

use crate::mqtt::{Command, Telemetry};
use crate::ota::OtaStatus;

pub const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Latest completed readings plus the current control values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub co2_ppm: Option<u16>,
    pub temp_c: Option<f32>,
    pub humidity_pct: Option<u8>,
    pub battery_v: Option<f32>,
    pub brightness: u8,
    pub abc: bool,
    pub ota: OtaStatus,
    pub network_up: bool,
}

pub struct SharedState {
    started: Instant,

    // Counters (lock-free)
    commands_dropped: AtomicU32,
    telemetry_sent: AtomicU32,

    // Readings and control values; writers hold the lock only for the update
    snapshot: RwLock<Snapshot>,

    // Commands received by the worker, consumed by the sensing loop
    commands: Mutex<Deque<Command, COMMAND_QUEUE_CAPACITY>>,
}

impl SharedState {
    pub fn new(brightness: u8, abc: bool) -> Self {
        Self {
            started: Instant::now(),
            commands_dropped: AtomicU32::new(0),
            telemetry_sent: AtomicU32::new(0),
            snapshot: RwLock::new(Snapshot {
                brightness: brightness.min(100),
                abc,
                ..Default::default()
            }),
            commands: Mutex::new(Deque::new()),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Complete copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update<F: FnOnce(&mut Snapshot)>(&self, f: F) {
        let mut data = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data);
    }

    /// Queue a command. When full the oldest one is dropped; returns it.
    pub fn push_command(&self, command: Command) -> Option<Command> {
        let mut queue = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let mut dropped = None;
        if queue.is_full() {
            dropped = queue.pop_front();
            self.commands_dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Cannot fail: a slot was freed above if needed
        let _ = queue.push_back(command);
        if let Some(old) = dropped {
            warn!("Command queue full, dropped {}", old);
        }
        dropped
    }

    /// Take every queued command, oldest first.
    pub fn drain_commands(&self) -> Vec<Command> {
        let mut queue = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::with_capacity(queue.len());
        while let Some(cmd) = queue.pop_front() {
            out.push(cmd);
        }
        out
    }

    pub fn commands_dropped(&self) -> u32 {
        self.commands_dropped.load(Ordering::Relaxed)
    }

    pub fn note_telemetry_sent(&self) {
        self.telemetry_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_sent(&self) -> u32 {
        self.telemetry_sent.load(Ordering::Relaxed)
    }

    /// Telemetry document built from the snapshot at this instant.
    pub fn telemetry(&self, firmware: &str) -> Telemetry {
        let s = self.snapshot();
        Telemetry {
            co2_ppm: s.co2_ppm,
            temp_c: s.temp_c,
            humidity_pct: s.humidity_pct,
            battery_v: s.battery_v,
            firmware: firmware.to_string(),
            uptime_s: self.uptime().as_secs(),
            brightness: s.brightness,
            abc: s.abc,
            ota: s.ota.as_str(),
        }
    }
}
