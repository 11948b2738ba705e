//! Update orchestration and command dispatch.
//!
//! [`UpdateCoordinator::check_for_update`] runs one
//! resolve → compare → stage → verify → activate → reboot attempt.
//! [`dispatch`] is the only place where remote commands turn into effects on
//! the device.

use std::time::Instant;

use anyhow::Result;
use log::{error, info, warn};

use crate::display::Display;
use crate::error::UpdateError;
use crate::mqtt::Command;
use crate::network::HttpTransport;
use crate::ota::{FirmwareFetcher, ImageExpectation, ImageSink, OtaApplier, OtaStatus, PartitionId, PartitionStorage};
use crate::sensors::Co2Sensor;
use crate::state::SharedState;
use crate::system::SystemControl;
use crate::version::{compare, Comparison, VersionNumber};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    NoUpdate,
    /// Boot pointer moved and restart requested. Only observable on
    /// backends whose restart returns.
    Applied { version: VersionNumber, partition: PartitionId },
    Failed(UpdateError),
}

pub struct UpdateCoordinator<T: HttpTransport, S: PartitionStorage> {
    fetcher: FirmwareFetcher<T>,
    applier: OtaApplier<S>,
}

// Feeds downloaded chunks into the staging partition at increasing offsets
struct StagingSink<'a, S: PartitionStorage> {
    applier: &'a mut OtaApplier<S>,
    partition: PartitionId,
    offset: u64,
}

impl<S: PartitionStorage> ImageSink for StagingSink<'_, S> {
    fn start(&mut self, declared_len: Option<u64>) -> Result<(), UpdateError> {
        self.applier.expect_length(declared_len);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), UpdateError> {
        self.applier.write_chunk(self.partition, self.offset, bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }
}

impl<T: HttpTransport, S: PartitionStorage> UpdateCoordinator<T, S> {
    pub fn new(fetcher: FirmwareFetcher<T>, applier: OtaApplier<S>) -> Self {
        Self { fetcher, applier }
    }

    pub fn applier(&self) -> &OtaApplier<S> {
        &self.applier
    }

    pub fn status(&self) -> OtaStatus {
        self.applier.status()
    }

    /// Keep the running image; called once the node has booted far enough.
    pub fn confirm_running(&mut self) {
        if let Err(e) = self.applier.confirm_running() {
            warn!("OTA mark-running-valid failed: {}", e);
        }
    }

    pub fn check_for_update(&mut self, current: VersionNumber, base_url: &str) -> UpdateOutcome {
        info!("OTA check: {}", base_url);
        self.applier.reset_status();

        let manifest = match self.fetcher.resolve_candidate(base_url) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return UpdateOutcome::NoUpdate,
            Err(e) => return UpdateOutcome::Failed(e.into()),
        };

        if compare(current, manifest.version) != Comparison::Newer {
            info!(
                "OTA up-to-date: current build {} (latest {})",
                current, manifest.version
            );
            return UpdateOutcome::NoUpdate;
        }
        info!("OTA update available: build {} -> {}", current, manifest.filename);

        match self.apply(base_url, &manifest.filename, manifest.sha256) {
            Ok(partition) => UpdateOutcome::Applied {
                version: manifest.version,
                partition,
            },
            Err(e) => {
                error!("OTA update to {} failed: {}", manifest.filename, e);
                UpdateOutcome::Failed(e)
            }
        }
    }

    fn apply(&mut self, base_url: &str, filename: &str, sha256: Option<[u8; 32]>) -> Result<PartitionId, UpdateError> {
        let partition = self.applier.begin_staging()?;

        let mut sink = StagingSink {
            applier: &mut self.applier,
            partition,
            offset: 0,
        };
        let image = match self.fetcher.download(base_url, filename, &mut sink) {
            Ok(image) => image,
            Err(e) => {
                self.applier.abort();
                return Err(e);
            }
        };

        let expect = ImageExpectation {
            length: image.declared_len,
            sha256,
        };
        let finalized = self.applier.finalize(partition, &expect)?;
        let target = self.applier.activate(finalized)?;

        info!("OTA update complete, rebooting...");
        self.applier.reboot_into(target)?;
        Ok(target)
    }
}

/// Devices a command can act on.
pub struct DispatchTargets<'a> {
    pub co2: &'a mut dyn Co2Sensor,
    pub display: &'a mut dyn Display,
    pub system: &'a mut dyn SystemControl,
}

/// What a dispatched command did, beyond the state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Zero calibration started at this instant
    ZeroCalibration(Instant),
    Restarting,
}

/// Apply `command` to the device and record the new control values in `state`.
/// Re-applying the same command leaves the device in the same state.
pub fn dispatch(command: Command, targets: &mut DispatchTargets<'_>, state: &SharedState) -> Result<Effect> {
    match command {
        Command::ZeroCalibrate => {
            targets.co2.calibrate_zero()?;
            info!("MQTT zero calibration triggered");
            Ok(Effect::ZeroCalibration(Instant::now()))
        }
        Command::SetAbc(enabled) => {
            targets.co2.set_abc(enabled)?;
            state.update(|s| s.abc = enabled);
            info!("MQTT set ABC: {}", enabled);
            Ok(Effect::None)
        }
        Command::SetBrightness(percent) => {
            let percent = percent.min(100);
            targets.display.set_brightness(percent)?;
            state.update(|s| s.brightness = percent);
            info!("MQTT brightness set to {}%", percent);
            Ok(Effect::None)
        }
        Command::Reboot => {
            info!("MQTT reboot requested");
            targets.system.restart();
            Ok(Effect::Restarting)
        }
    }
}
