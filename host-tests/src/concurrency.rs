use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use c6_co2_node::config::Config;
use c6_co2_node::coordinator::UpdateCoordinator;
use c6_co2_node::error::NetworkError;
use c6_co2_node::network::{HttpResponse, HttpTransport};
use c6_co2_node::ota::{FirmwareFetcher, OtaApplier, PartitionId};
use c6_co2_node::scheduler::{NetworkWorker, Peripherals, SensingLoop, WorkerSettings};
use c6_co2_node::sensors::ClimateReading;
use c6_co2_node::sim::{LoopbackBroker, RamFlash, SimBattery, SimClimate, SimCo2, SimDisplay, SimLink, SimSystem};
use c6_co2_node::state::SharedState;
use c6_co2_node::version::FilenamePattern;

use crate::rig::BASE_URL;

const STALL: Duration = Duration::from_secs(3);

/// Server that accepts the request and then sits on it.
#[derive(Clone, Default)]
struct StalledHttp {
    entered: Arc<AtomicBool>,
    returned: Arc<AtomicBool>,
}

impl HttpTransport for StalledHttp {
    fn get<'a>(&'a mut self, _url: &str, _timeout: Duration) -> Result<HttpResponse<'a>, NetworkError> {
        self.entered.store(true, Ordering::SeqCst);
        thread::sleep(STALL);
        self.returned.store(true, Ordering::SeqCst);
        Err(NetworkError::Timeout(STALL.as_millis() as u64))
    }
}

fn wait_for(flag: &AtomicBool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn stalled_update_check_does_not_hold_up_sensing() {
    let mut config = Config::default();
    config.ota.base_url = BASE_URL.into();
    config.cadence.co2_ms = 50;
    config.cadence.climate_ms = 50;
    config.cadence.network_tick_ms = 10;

    let state = Arc::new(SharedState::new(config.display.brightness, false));
    let peripherals = Peripherals {
        co2: Box::new(SimCo2::new((400..440).map(Some).collect())),
        climate: Box::new(SimClimate::new(vec![Some(ClimateReading::new(21.0, 40.0))])),
        battery: Box::new(SimBattery::new(vec![Some(3.9)])),
        display: Box::new(SimDisplay::new()),
        system: Box::new(SimSystem::new()),
    };
    let mut sensing = SensingLoop::new(peripherals, Arc::clone(&state), &config.cadence);
    sensing.start().unwrap();

    let http = StalledHttp::default();
    let updates = UpdateCoordinator::new(
        FirmwareFetcher::new(http.clone(), FilenamePattern::default()),
        OtaApplier::new(RamFlash::new(PartitionId::SlotA, 64 * 1024)),
    );
    let worker: NetworkWorker<SimLink, StalledHttp, RamFlash, LoopbackBroker> = NetworkWorker::new(
        SimLink::new(true),
        Some(updates),
        None,
        Arc::clone(&state),
        WorkerSettings::from_config(&config),
    );
    let stop = Arc::new(AtomicBool::new(false));
    let handle = worker.spawn(Arc::clone(&stop)).unwrap();

    // The first OTA check is due immediately
    assert!(wait_for(&http.entered, Duration::from_secs(2)));

    let mut seen = Vec::new();
    let window = Instant::now() + Duration::from_secs(1);
    while Instant::now() < window {
        let started = Instant::now();
        sensing.tick(started);
        assert!(started.elapsed() < STALL / 4, "sensing tick blocked");
        if let Some(ppm) = state.snapshot().co2_ppm {
            if seen.last() != Some(&ppm) {
                seen.push(ppm);
            }
        }
        thread::sleep(Duration::from_millis(20));
    }

    // The request is still in flight while readings moved on
    assert!(!http.returned.load(Ordering::SeqCst));
    assert!(seen.len() >= 5, "co2 updated only {} times", seen.len());
    assert_eq!(state.snapshot().temp_c, Some(21.0));

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
    assert!(http.returned.load(Ordering::SeqCst));
}
