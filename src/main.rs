use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use c6_co2_node::config::{self, Config};
use c6_co2_node::coordinator::UpdateCoordinator;
use c6_co2_node::logging;
use c6_co2_node::mqtt::{ChannelSettings, ControlChannel};
use c6_co2_node::ota::{FirmwareFetcher, OtaApplier};
use c6_co2_node::scheduler::{SensingLoop, WorkerSettings};
use c6_co2_node::state::SharedState;
use c6_co2_node::version::{self, FilenamePattern};

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

fn apply_log_level(config: &Config) {
    if !logging::set_max_level_from_str(&config.log_level) {
        warn!("Unknown log level '{}', keeping default", config.log_level);
    }
}

fn shared_state(config: &Config) -> Arc<SharedState> {
    Arc::new(SharedState::new(config.display.brightness, config.display.abc_enabled))
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use c6_co2_node::esp::{Board, EspHttp, EspMqttConnector, EspPartitions, NvsConfigStore, WifiLink};
    use c6_co2_node::scheduler::NetworkWorker;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    esp_idf_svc::sys::link_patches();
    logging::init_logger()?;
    info!("C6 CO2 node {}", version::firmware_version());

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let mut store = NvsConfigStore::new(nvs.clone())?;
    let config = config::load_or_default(&mut store)?;
    apply_log_level(&config);

    // Cancel the pending rollback before anything else can fail
    let pattern = FilenamePattern::new(&config.ota.file_prefix, &config.ota.file_ext);
    let mut updates = UpdateCoordinator::new(
        FirmwareFetcher::new(EspHttp::new(), pattern),
        OtaApplier::new(EspPartitions::take()?),
    );
    updates.confirm_running();

    let board = Board::take()?;
    let state = shared_state(&config);
    let mut sensing = SensingLoop::new(board.peripherals, Arc::clone(&state), &config.cadence);
    sensing.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    let worker = match WifiLink::new(board.modem, sys_loop, nvs, &config.wifi.ssid, &config.wifi.password) {
        Ok(link) => {
            let channel = config.mqtt.enabled.then(|| {
                ControlChannel::new(
                    EspMqttConnector,
                    ChannelSettings::from_config(&config.mqtt, &version::firmware_version()),
                )
            });
            let worker = NetworkWorker::new(
                link,
                config.ota.enabled.then_some(updates),
                channel,
                Arc::clone(&state),
                WorkerSettings::from_config(&config),
            );
            Some(worker.spawn(Arc::clone(&stop))?)
        }
        Err(e) => {
            warn!("WiFi init failed, running offline: {:?}", e);
            None
        }
    };

    info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });
    sensing.run(&stop);

    if let Some(handle) = worker {
        let _ = handle.join();
    }
    Ok(())
}

/// Host build: the same loops against the in-memory backends, for a fixed time.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use c6_co2_node::ota::PartitionId;
    use c6_co2_node::scheduler::{NetworkWorker, Peripherals};
    use c6_co2_node::sensors::ClimateReading;
    use c6_co2_node::sim::{
        LoopbackBroker, MemoryConfigStore, RamFlash, Reply, ScriptedHttp, SimBattery, SimClimate, SimCo2, SimDisplay,
        SimLink, SimSystem,
    };

    logging::init_logger()?;
    let run_for = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(15));
    info!("C6 CO2 node {} (simulation, {:?})", version::firmware_version(), run_for);

    let config = config::load_or_default(&mut MemoryConfigStore::new())?;
    apply_log_level(&config);

    // Advertise the running build so the OTA check finds nothing to do
    let pattern = FilenamePattern::new(&config.ota.file_prefix, &config.ota.file_ext);
    let manifest = pattern.filename(version::current_build());
    let http = ScriptedHttp::new().with(
        &c6_co2_node::network::join_url(&config.ota.base_url, c6_co2_node::ota::MANIFEST_FILE),
        Reply::ok(manifest.into_bytes()),
    );
    let mut updates = UpdateCoordinator::new(
        FirmwareFetcher::new(http, pattern),
        OtaApplier::new(RamFlash::new(PartitionId::SlotA, 1536 * 1024)),
    );
    updates.confirm_running();

    let state = shared_state(&config);
    let peripherals = Peripherals {
        co2: Box::new(SimCo2::new(vec![Some(612), Some(640), None, Some(655)])),
        climate: Box::new(SimClimate::new(vec![Some(ClimateReading::new(21.4, 41.0))])),
        battery: Box::new(SimBattery::new(vec![Some(3.92)])),
        display: Box::new(SimDisplay::new()),
        system: Box::new(SimSystem::new()),
    };
    let mut sensing = SensingLoop::new(peripherals, Arc::clone(&state), &config.cadence);
    sensing.start()?;

    let broker = LoopbackBroker::new();
    let channel = config.mqtt.enabled.then(|| {
        ControlChannel::new(
            broker.clone(),
            ChannelSettings::from_config(&config.mqtt, &version::firmware_version()),
        )
    });
    let worker = NetworkWorker::new(
        SimLink::new(true),
        config.ota.enabled.then_some(updates),
        channel,
        Arc::clone(&state),
        WorkerSettings::from_config(&config),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handle = worker.spawn(Arc::clone(&stop))?;
    {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            thread::sleep(run_for);
            stop.store(true, Ordering::Relaxed);
        });
    }
    sensing.run(&stop);

    let _ = handle.join();
    let status_topic = format!("{}/status", config.mqtt.prefix.trim_end_matches('/'));
    info!(
        "Simulation finished: {} telemetry documents, last {:?}",
        state.telemetry_sent(),
        broker
            .published(&status_topic)
            .last()
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
    );
    Ok(())
}
