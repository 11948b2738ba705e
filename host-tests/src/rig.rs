use std::sync::Arc;
use std::time::Instant;

use c6_co2_node::config::Config;
use c6_co2_node::coordinator::UpdateCoordinator;
use c6_co2_node::mqtt::{ChannelSettings, ControlChannel};
use c6_co2_node::network::join_url;
use c6_co2_node::ota::{FirmwareFetcher, OtaApplier, PartitionId, IMAGE_MAGIC, MANIFEST_FILE};
use c6_co2_node::scheduler::{NetworkWorker, Peripherals, SensingLoop, WorkerSettings};
use c6_co2_node::sensors::ClimateReading;
use c6_co2_node::sim::{
    LoopbackBroker, RamFlash, Reply, ScriptedHttp, SimBattery, SimClimate, SimCo2, SimDisplay, SimLink, SimSystem,
};
use c6_co2_node::state::SharedState;
use c6_co2_node::version::{FilenamePattern, VersionNumber};
use sha2::{Digest, Sha256};

pub const BASE_URL: &str = "http://fw.test/firmware";
pub const PREFIX: &str = "c6-demo";
pub const SLOT_SIZE: u64 = 64 * 1024;

pub type Worker = NetworkWorker<SimLink, ScriptedHttp, RamFlash, LoopbackBroker>;

pub struct RigOptions {
    pub current_build: u32,
    pub running: PartitionId,
    pub co2: Vec<Option<u16>>,
    pub abc: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            current_build: 7,
            running: PartitionId::SlotA,
            co2: vec![Some(640)],
            abc: false,
        }
    }
}

/// One simulated node. The collaborator handles share state with the
/// copies owned by the loops.
pub struct Rig {
    pub state: Arc<SharedState>,
    pub sensing: SensingLoop,
    pub worker: Worker,
    pub link: SimLink,
    pub broker: LoopbackBroker,
    pub http: ScriptedHttp,
    pub co2: SimCo2,
    pub display: SimDisplay,
    pub system: SimSystem,
}

impl Rig {
    pub fn new(options: RigOptions) -> Self {
        let mut config = Config::default();
        config.ota.base_url = BASE_URL.into();
        config.mqtt.prefix = PREFIX.into();
        config.mqtt.client_id = PREFIX.into();
        config.display.abc_enabled = options.abc;

        let state = Arc::new(SharedState::new(config.display.brightness, config.display.abc_enabled));
        let co2 = SimCo2::new(options.co2);
        let display = SimDisplay::new();
        let system = SimSystem::new();
        let peripherals = Peripherals {
            co2: Box::new(co2.clone()),
            climate: Box::new(SimClimate::new(vec![Some(ClimateReading::new(22.5, 38.0))])),
            battery: Box::new(SimBattery::new(vec![Some(3.95)])),
            display: Box::new(display.clone()),
            system: Box::new(system.clone()),
        };
        let mut sensing = SensingLoop::new(peripherals, Arc::clone(&state), &config.cadence);
        sensing.start().unwrap();

        let link = SimLink::new(true);
        let broker = LoopbackBroker::new();
        let http = ScriptedHttp::new();
        let firmware = format!("0.3.0+{:04}", options.current_build);
        let mut updates = UpdateCoordinator::new(
            FirmwareFetcher::new(http.clone(), FilenamePattern::default()),
            OtaApplier::new(RamFlash::new(options.running, SLOT_SIZE)),
        );
        updates.confirm_running();
        let channel = ControlChannel::new(broker.clone(), ChannelSettings::from_config(&config.mqtt, &firmware));

        let mut settings = WorkerSettings::from_config(&config);
        settings.current_build = VersionNumber(options.current_build);
        settings.firmware = firmware;
        let worker = NetworkWorker::new(link.clone(), Some(updates), Some(channel), Arc::clone(&state), settings);

        Self {
            state,
            sensing,
            worker,
            link,
            broker,
            http,
            co2,
            display,
            system,
        }
    }

    /// Network work first, so commands it receives run in the same tick.
    pub fn tick(&mut self, now: Instant) {
        self.worker.tick(now);
        self.sensing.tick(now);
    }

    pub fn flash(&self) -> &RamFlash {
        self.worker.updates().unwrap().applier().storage()
    }

    pub fn cmd(&self, payload: &str) {
        self.broker.inject(&format!("{}/cmd", PREFIX), payload.as_bytes());
    }

    /// Last telemetry document the broker saw.
    pub fn last_status(&self) -> serde_json::Value {
        let published = self.broker.published(&format!("{}/status", PREFIX));
        let last = published.last().expect("no telemetry published");
        serde_json::from_slice(&last.payload).unwrap()
    }
}

/// A plausible application image of `len` bytes.
pub fn app_image(len: usize) -> Vec<u8> {
    let mut image = vec![IMAGE_MAGIC];
    image.extend((1..len).map(|i| (i % 251) as u8));
    image
}

pub fn image_url(build: u32) -> String {
    join_url(BASE_URL, &FilenamePattern::default().filename(VersionNumber(build)))
}

/// Advertise `build` with the digest of `advertised`, and serve `served` as its image.
pub fn serve_release(http: &ScriptedHttp, build: u32, advertised: &[u8], served: Reply) {
    let name = FilenamePattern::default().filename(VersionNumber(build));
    let manifest = format!("{} {}\n", name, hex::encode(Sha256::digest(advertised)));
    http.set(&join_url(BASE_URL, MANIFEST_FILE), Reply::ok(manifest.into_bytes()));
    http.set(&image_url(build), served);
}
