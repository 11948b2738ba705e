// Cooperative scheduling: the sensing loop on the main thread and the
// network worker on its own thread. They meet only in SharedState.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::config::{CadenceConfig, Config};
use crate::coordinator::{dispatch, DispatchTargets, Effect, UpdateCoordinator, UpdateOutcome};
use crate::display::{Display, DisplayView};
use crate::mqtt::{ControlChannel, MqttConnector};
use crate::network::{HttpTransport, Link};
use crate::ota::{OtaStatus, PartitionStorage};
use crate::sensors::{BatteryMonitor, ClimateSensor, Co2Sensor};
use crate::state::SharedState;
use crate::system::SystemControl;
use crate::version::{self, VersionNumber};

/// How long the screen shows the zero-calibration notice.
pub const ZERO_FEEDBACK: Duration = Duration::from_secs(3);

const WORKER_STACK_SIZE: usize = 16 * 1024;

/// A periodic task's due time. The first run is due immediately.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    period: Duration,
    next_due: Option<Instant>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self { period, next_due: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due.map_or(true, |due| now >= due)
    }

    /// If due, schedule the next run one period from `now` and return true.
    pub fn fire(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.next_due = Some(now + self.period);
            true
        } else {
            false
        }
    }
}

pub struct Peripherals {
    pub co2: Box<dyn Co2Sensor>,
    pub climate: Box<dyn ClimateSensor>,
    pub battery: Box<dyn BatteryMonitor>,
    pub display: Box<dyn Display>,
    pub system: Box<dyn SystemControl>,
}

/// Sensor polling, command execution and display refresh.
pub struct SensingLoop {
    peripherals: Peripherals,
    state: Arc<SharedState>,
    climate: Cadence,
    co2: Cadence,
    battery: Cadence,
    tick: Duration,
    zero_until: Option<Instant>,
    last_view: Option<DisplayView>,
}

impl SensingLoop {
    pub fn new(peripherals: Peripherals, state: Arc<SharedState>, cadence: &CadenceConfig) -> Self {
        Self {
            peripherals,
            state,
            climate: Cadence::new(cadence.climate()),
            co2: Cadence::new(cadence.co2()),
            battery: Cadence::new(cadence.battery()),
            tick: cadence.sensing_tick(),
            zero_until: None,
            last_view: None,
        }
    }

    /// Push the initial control values from the shared state to the devices.
    pub fn start(&mut self) -> Result<()> {
        let s = self.state.snapshot();
        self.peripherals.display.set_brightness(s.brightness)?;
        if let Err(e) = self.peripherals.co2.set_abc(s.abc) {
            warn!("CO2 sensor: initial ABC setting failed: {:?}", e);
        }
        Ok(())
    }

    pub fn tick(&mut self, now: Instant) {
        self.run_commands(now);

        if self.climate.fire(now) {
            let reading = self.peripherals.climate.read_latest();
            self.state.update(|s| {
                s.temp_c = reading.map(|r| r.temperature_c);
                s.humidity_pct = reading.map(|r| r.humidity_pct);
            });
        }

        if self.co2.fire(now) {
            let ppm = self.peripherals.co2.read_latest();
            self.state.update(|s| s.co2_ppm = ppm);
        }

        if self.battery.fire(now) {
            let volts = self.peripherals.battery.read_latest();
            self.state.update(|s| s.battery_v = volts);
        }

        if self.zero_until.map_or(false, |until| now >= until) {
            self.zero_until = None;
        }

        self.refresh_display();
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        info!("Sensing loop started, tick {:?}", self.tick);
        while !stop.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            thread::sleep(self.tick);
        }
        info!("Sensing loop stopped");
    }

    fn run_commands(&mut self, now: Instant) {
        for command in self.state.drain_commands() {
            let mut targets = DispatchTargets {
                co2: self.peripherals.co2.as_mut(),
                display: self.peripherals.display.as_mut(),
                system: self.peripherals.system.as_mut(),
            };
            match dispatch(command, &mut targets, &self.state) {
                Ok(Effect::ZeroCalibration(_)) => self.zero_until = Some(now + ZERO_FEEDBACK),
                Ok(Effect::Restarting) | Ok(Effect::None) => {}
                Err(e) => error!("Command {} failed: {:?}", command, e),
            }
        }
    }

    // Redraw only when what the screen shows would change
    fn refresh_display(&mut self) {
        let view = DisplayView::from_snapshot(&self.state.snapshot(), self.zero_until.is_some());
        if self.last_view == Some(view) {
            return;
        }
        match self.peripherals.display.render(&view) {
            Ok(()) => self.last_view = Some(view),
            Err(e) => error!("Display render failed: {:?}", e),
        }
    }
}

pub struct WorkerSettings {
    pub ota_base_url: String,
    pub current_build: VersionNumber,
    pub firmware: String,
    pub telemetry: Duration,
    pub ota_check: Duration,
    pub mqtt_reconnect: Duration,
    pub tick: Duration,
}

impl WorkerSettings {
    /// Settings for the running image.
    pub fn from_config(config: &Config) -> Self {
        Self {
            ota_base_url: config.ota.base_url.clone(),
            current_build: version::current_build(),
            firmware: version::firmware_version(),
            telemetry: config.cadence.telemetry(),
            ota_check: config.ota_check_interval(),
            mqtt_reconnect: config.mqtt_reconnect_interval(),
            tick: config.cadence.network_tick(),
        }
    }
}

/// Everything that may block on the network.
pub struct NetworkWorker<L, T, S, M>
where
    L: Link,
    T: HttpTransport,
    S: PartitionStorage,
    M: MqttConnector,
{
    link: L,
    updates: Option<UpdateCoordinator<T, S>>,
    channel: Option<ControlChannel<M>>,
    state: Arc<SharedState>,
    settings: WorkerSettings,
    telemetry: Cadence,
    ota: Cadence,
    reconnect: Cadence,
}

impl<L, T, S, M> NetworkWorker<L, T, S, M>
where
    L: Link,
    T: HttpTransport,
    S: PartitionStorage,
    M: MqttConnector,
{
    /// `updates` or `channel` may be `None` when disabled in config.
    pub fn new(
        link: L,
        updates: Option<UpdateCoordinator<T, S>>,
        channel: Option<ControlChannel<M>>,
        state: Arc<SharedState>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            link,
            updates,
            channel,
            state,
            telemetry: Cadence::new(settings.telemetry),
            ota: Cadence::new(settings.ota_check),
            reconnect: Cadence::new(settings.mqtt_reconnect),
            settings,
        }
    }

    pub fn updates(&self) -> Option<&UpdateCoordinator<T, S>> {
        self.updates.as_ref()
    }

    pub fn channel(&self) -> Option<&ControlChannel<M>> {
        self.channel.as_ref()
    }

    pub fn tick(&mut self, now: Instant) {
        let ota_due = self.updates.is_some() && self.ota.fire(now);
        let reconnect_due = self.channel.as_ref().map_or(false, |c| !c.is_open()) && self.reconnect.fire(now);
        let telemetry_due = self.telemetry.fire(now);

        if (ota_due || reconnect_due) && !self.link.is_up() {
            if let Err(e) = self.link.ensure_up() {
                warn!("Network unavailable, skipping this cycle: {}", e);
                self.state.update(|s| s.network_up = false);
                return;
            }
        }
        let up = self.link.is_up();
        self.state.update(|s| s.network_up = up);

        if let Some(channel) = self.channel.as_mut() {
            if reconnect_due {
                if let Err(e) = channel.connect() {
                    warn!("MQTT connect failed: {}", e);
                }
            }

            for command in channel.commands() {
                self.state.push_command(command);
            }

            if telemetry_due && channel.is_connected() {
                let telemetry = self.state.telemetry(&self.settings.firmware);
                match channel.publish_telemetry(&telemetry) {
                    Ok(()) => self.state.note_telemetry_sent(),
                    Err(e) => warn!("MQTT publish failed: {}", e),
                }
            }
        }

        if ota_due {
            if let Some(updates) = self.updates.as_mut() {
                self.state.update(|s| s.ota = OtaStatus::Downloading { progress: 0 });
                let outcome = updates.check_for_update(self.settings.current_build, &self.settings.ota_base_url);
                match &outcome {
                    UpdateOutcome::NoUpdate => debug!("OTA: nothing to do"),
                    UpdateOutcome::Applied { version, partition } => {
                        info!("OTA: build {} active in {}", version, partition)
                    }
                    UpdateOutcome::Failed(e) => error!("OTA check failed: {}", e),
                }
                let status = match outcome {
                    UpdateOutcome::NoUpdate => OtaStatus::Idle,
                    _ => updates.status(),
                };
                self.state.update(|s| s.ota = status);
            }
        }
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        info!("Network worker started, tick {:?}", self.settings.tick);
        while !stop.load(Ordering::Relaxed) {
            self.tick(Instant::now());
            thread::sleep(self.settings.tick);
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.disconnect();
        }
        info!("Network worker stopped");
    }
}

impl<L, T, S, M> NetworkWorker<L, T, S, M>
where
    L: Link + 'static,
    T: HttpTransport + 'static,
    S: PartitionStorage + 'static,
    M: MqttConnector + 'static,
{
    /// Run on a dedicated thread until `stop` is set.
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> Result<JoinHandle<Self>> {
        let handle = thread::Builder::new()
            .name("network".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                self.run(&stop);
                self
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{ChannelSettings, Command, DeviceDescriptor, Topics, CONNECT_TIMEOUT, KEEP_ALIVE};
    use crate::ota::{FirmwareFetcher, OtaApplier, PartitionId};
    use crate::sensors::ClimateReading;
    use crate::sim::{LoopbackBroker, RamFlash, ScriptedHttp, SimBattery, SimClimate, SimCo2, SimDisplay, SimLink, SimSystem};
    use crate::version::FilenamePattern;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn cadence_first_run_is_immediate() {
        let t0 = Instant::now();
        let mut c = Cadence::new(Duration::from_secs(5));
        assert!(c.fire(t0));
        assert!(!c.fire(t0 + 4 * SEC));
        assert!(c.fire(t0 + 5 * SEC));
        assert!(!c.is_due(t0 + 9 * SEC));
    }

    fn sensing(co2: SimCo2, display: SimDisplay, state: &Arc<SharedState>) -> SensingLoop {
        let peripherals = Peripherals {
            co2: Box::new(co2),
            climate: Box::new(SimClimate::new(vec![Some(ClimateReading::new(21.0, 40.0))])),
            battery: Box::new(SimBattery::new(vec![Some(3.9), None])),
            display: Box::new(display),
            system: Box::new(SimSystem::new()),
        };
        SensingLoop::new(peripherals, Arc::clone(state), &CadenceConfig::default())
    }

    #[test]
    fn sensing_polls_on_independent_cadences() {
        let state = Arc::new(SharedState::new(10, false));
        let co2 = SimCo2::new(vec![Some(600), None, Some(650)]);
        let mut lp = sensing(co2, SimDisplay::new(), &state);
        let t0 = Instant::now();

        lp.tick(t0);
        let s = state.snapshot();
        assert_eq!(s.co2_ppm, Some(600));
        assert_eq!(s.humidity_pct, Some(40));
        assert_eq!(s.battery_v, Some(3.9));

        // 5 s later: CO2 read fails and is reported absent
        lp.tick(t0 + 5 * SEC);
        assert_eq!(state.snapshot().co2_ppm, None);
        assert_eq!(state.snapshot().battery_v, Some(3.9));

        // 10 s: battery read fails too
        lp.tick(t0 + 10 * SEC);
        assert_eq!(state.snapshot().co2_ppm, Some(650));
        assert_eq!(state.snapshot().battery_v, None);
    }

    #[test]
    fn display_redraws_only_on_change() {
        let state = Arc::new(SharedState::new(10, false));
        let display = SimDisplay::new();
        let mut lp = sensing(SimCo2::new(vec![Some(600)]), display.clone(), &state);
        let t0 = Instant::now();

        lp.tick(t0);
        lp.tick(t0 + Duration::from_millis(200));
        lp.tick(t0 + Duration::from_millis(400));
        assert_eq!(display.renders().len(), 1);
    }

    #[test]
    fn queued_commands_run_on_the_next_tick() {
        let state = Arc::new(SharedState::new(10, true));
        let co2 = SimCo2::new(vec![Some(600)]);
        let display = SimDisplay::new();
        let mut lp = sensing(co2.clone(), display.clone(), &state);
        lp.start().unwrap();
        assert_eq!(co2.abc(), Some(true));

        state.push_command(Command::SetBrightness(80));
        state.push_command(Command::ZeroCalibrate);
        let t0 = Instant::now();
        lp.tick(t0);

        assert_eq!(display.brightness(), Some(80));
        assert_eq!(co2.calibrations(), 1);
        assert!(display.renders().last().unwrap().zero_calibrating);

        lp.tick(t0 + ZERO_FEEDBACK);
        assert!(!display.renders().last().unwrap().zero_calibrating);
    }

    type Worker = NetworkWorker<SimLink, ScriptedHttp, RamFlash, LoopbackBroker>;

    fn worker(link: &SimLink, broker: &LoopbackBroker, http: &ScriptedHttp, state: &Arc<SharedState>) -> Worker {
        let updates = UpdateCoordinator::new(
            FirmwareFetcher::new(http.clone(), FilenamePattern::default()),
            OtaApplier::new(RamFlash::new(PartitionId::SlotA, 4096)),
        );
        let channel = ControlChannel::new(
            broker.clone(),
            ChannelSettings {
                host: "broker.test".into(),
                port: 1883,
                client_id: "c6-demo".into(),
                username: None,
                password: None,
                keep_alive: KEEP_ALIVE,
                connect_timeout: CONNECT_TIMEOUT,
                topics: Topics::new("c6-demo"),
                device: DeviceDescriptor::for_prefix("c6-demo", "0.3.0+0003"),
            },
        );
        NetworkWorker::new(
            link.clone(),
            Some(updates),
            Some(channel),
            Arc::clone(state),
            WorkerSettings {
                ota_base_url: "http://fw.local/firmware".into(),
                current_build: VersionNumber(3),
                firmware: "0.3.0+0003".into(),
                telemetry: 10 * SEC,
                ota_check: 900 * SEC,
                mqtt_reconnect: 30 * SEC,
                tick: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn worker_connects_publishes_and_forwards_commands() {
        let link = SimLink::new(true);
        let broker = LoopbackBroker::new();
        let http = ScriptedHttp::new();
        let state = Arc::new(SharedState::new(10, false));
        state.update(|s| s.co2_ppm = Some(720));
        let mut w = worker(&link, &broker, &http, &state);

        let t0 = Instant::now();
        w.tick(t0);
        assert!(w.channel().unwrap().is_connected());
        assert_eq!(broker.published("c6-demo/status").len(), 1);
        // No manifest served: the OTA check failed and nothing was staged
        assert_eq!(http.requests(), vec!["http://fw.local/firmware/latest.txt".to_string()]);
        assert_eq!(state.snapshot().ota, OtaStatus::Idle);

        broker.inject("c6-demo/cmd", b"brightness:30");
        w.tick(t0 + Duration::from_millis(100));
        assert_eq!(state.drain_commands(), vec![Command::SetBrightness(30)]);

        // Telemetry waits for its own cadence
        assert_eq!(broker.published("c6-demo/status").len(), 1);
        w.tick(t0 + 10 * SEC);
        assert_eq!(broker.published("c6-demo/status").len(), 2);
        assert_eq!(state.telemetry_sent(), 2);
    }

    #[test]
    fn link_down_skips_cycle_until_next_cadence() {
        let link = SimLink::new(false);
        let broker = LoopbackBroker::new();
        let http = ScriptedHttp::new();
        let state = Arc::new(SharedState::new(10, false));
        let mut w = worker(&link, &broker, &http, &state);

        let t0 = Instant::now();
        w.tick(t0);
        assert!(!state.snapshot().network_up);
        assert!(http.requests().is_empty());
        assert!(!w.channel().unwrap().is_connected());

        // Link back, but reconnect and OTA wait for their next due time
        link.set_up(true);
        w.tick(t0 + SEC);
        assert!(!w.channel().unwrap().is_connected());
        assert!(http.requests().is_empty());

        w.tick(t0 + 30 * SEC);
        assert!(w.channel().unwrap().is_connected());
    }

    #[test]
    fn worker_settings_from_config() {
        let settings = WorkerSettings::from_config(&Config::default());
        assert_eq!(settings.ota_check, 900 * SEC);
        assert_eq!(settings.mqtt_reconnect, 30 * SEC);
        assert_eq!(settings.telemetry, 10 * SEC);
        assert_eq!(settings.tick, Duration::from_millis(100));
        assert!(settings.firmware.starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn worker_thread_stops_and_announces_offline() {
        let link = SimLink::new(true);
        let broker = LoopbackBroker::new();
        let http = ScriptedHttp::new();
        let state = Arc::new(SharedState::new(10, false));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = worker(&link, &broker, &http, &state).spawn(Arc::clone(&stop)).unwrap();
        let deadline = Instant::now() + 5 * SEC;
        while broker.retained("c6-demo/availability").is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(broker.retained("c6-demo/availability").as_deref(), Some(&b"online"[..]));

        stop.store(true, Ordering::Relaxed);
        let w = handle.join().unwrap();
        assert!(!w.channel().unwrap().is_connected());
        assert_eq!(broker.retained("c6-demo/availability").as_deref(), Some(&b"offline"[..]));
    }
}
