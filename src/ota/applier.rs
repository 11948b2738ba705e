// OTA applier - stages an image into the inactive slot and flips the boot pointer

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::partition::{PartitionId, PartitionStorage};
use crate::error::{FlashError, IntegrityError, UpdateError};

/// First byte of every ESP application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaStatus {
    #[default]
    Idle,
    Downloading { progress: u8 },
    Verifying,
    Ready,
    Failed,
}

impl OtaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Idle => "idle",
            OtaStatus::Downloading { .. } => "downloading",
            OtaStatus::Verifying => "verifying",
            OtaStatus::Ready => "ready",
            OtaStatus::Failed => "failed",
        }
    }
}

/// What the server told us about the image before we received it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageExpectation {
    pub length: Option<u64>,
    pub sha256: Option<[u8; 32]>,
}

/// Proof that a staged image passed every check.
///
/// Only `OtaApplier::finalize` constructs one and `activate` consumes it.
#[derive(Debug)]
pub struct FinalizedImage {
    partition: PartitionId,
    length: u64,
    sha256: [u8; 32],
}

impl FinalizedImage {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

enum Stage {
    Idle,
    Staging {
        partition: PartitionId,
        capacity: u64,
        written: u64,
        first_byte: Option<u8>,
        hasher: Sha256,
    },
    Staged {
        partition: PartitionId,
    },
    Active {
        partition: PartitionId,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Staging { .. } => "staging",
            Stage::Staged { .. } => "staged",
            Stage::Active { .. } => "active (pending reboot)",
        }
    }
}

pub struct OtaApplier<S: PartitionStorage> {
    storage: S,
    stage: Stage,
    expected_size: Option<u64>,
    status: OtaStatus,
}

impl<S: PartitionStorage> OtaApplier<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            stage: Stage::Idle,
            expected_size: None,
            status: OtaStatus::Idle,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    pub fn stage_name(&self) -> &'static str {
        self.stage.name()
    }

    /// Mark the running image good so the bootloader keeps it.
    pub fn confirm_running(&mut self) -> Result<(), FlashError> {
        self.storage.mark_running_valid()?;
        info!("OTA: running partition {} marked valid", self.storage.running());
        Ok(())
    }

    /// Forget the outcome of a previous session. A live session is kept.
    pub fn reset_status(&mut self) {
        if matches!(self.stage, Stage::Idle) {
            self.status = OtaStatus::Idle;
        }
    }

    /// Select the inactive OTA slot and erase it.
    pub fn begin_staging(&mut self) -> Result<PartitionId, FlashError> {
        if !matches!(self.stage, Stage::Idle) {
            return Err(FlashError::InvalidState(self.stage.name()));
        }

        let running = self.storage.running();
        let boot = self.storage.boot_target();
        let target = self
            .storage
            .list_partitions()
            .into_iter()
            .find(|p| p.id.is_ota_slot() && p.id != running && p.id != boot)
            .ok_or(FlashError::NoStagingPartition)?;

        if let Err(e) = self.storage.erase(target.id) {
            self.status = OtaStatus::Failed;
            return Err(e);
        }

        info!(
            "OTA: staging into {} ({} bytes), running {}, boot {}",
            target.id, target.size, running, boot
        );
        self.stage = Stage::Staging {
            partition: target.id,
            capacity: target.size,
            written: 0,
            first_byte: None,
            hasher: Sha256::new(),
        };
        self.expected_size = None;
        self.status = OtaStatus::Downloading { progress: 0 };
        Ok(target.id)
    }

    /// Declared image size, used for progress reporting.
    pub fn expect_length(&mut self, length: Option<u64>) {
        self.expected_size = length;
    }

    /// Append `bytes` at `offset`. Writes must be strictly sequential.
    pub fn write_chunk(&mut self, partition: PartitionId, offset: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let check = match &self.stage {
            Stage::Staging {
                partition: staging,
                capacity,
                written,
                ..
            } => {
                if partition != *staging {
                    Err(FlashError::WrongPartition {
                        staging: *staging,
                        got: partition,
                    })
                } else if offset != *written {
                    Err(FlashError::OutOfOrder {
                        expected: *written,
                        got: offset,
                    })
                } else if offset + bytes.len() as u64 > *capacity {
                    Err(FlashError::Overflow {
                        partition,
                        capacity: *capacity,
                    })
                } else {
                    Ok(())
                }
            }
            other => Err(FlashError::InvalidState(other.name())),
        };

        if let Err(e) = check.and_then(|_| self.storage.write(partition, offset, bytes)) {
            self.abort();
            return Err(e);
        }

        if let Stage::Staging {
            written,
            first_byte,
            hasher,
            ..
        } = &mut self.stage
        {
            if first_byte.is_none() {
                *first_byte = bytes.first().copied();
            }
            hasher.update(bytes);
            *written += bytes.len() as u64;

            // Update progress
            if let Some(expected) = self.expected_size.filter(|e| *e > 0) {
                let progress = ((*written * 100) / expected).min(100) as u8;
                self.status = OtaStatus::Downloading { progress };
            }
        }
        Ok(())
    }

    /// Validate the staged image. Any failure discards the staging slot.
    pub fn finalize(&mut self, partition: PartitionId, expect: &ImageExpectation) -> Result<FinalizedImage, UpdateError> {
        let stage = std::mem::replace(&mut self.stage, Stage::Idle);
        let (staging, written, first_byte, hasher) = match stage {
            Stage::Staging {
                partition: staging,
                written,
                first_byte,
                hasher,
                ..
            } => (staging, written, first_byte, hasher),
            other => {
                let name = other.name();
                self.stage = other;
                return Err(FlashError::InvalidState(name).into());
            }
        };
        // Keep the slot recorded so abort() can erase it
        self.stage = Stage::Staged { partition: staging };
        self.status = OtaStatus::Verifying;

        if partition != staging {
            self.abort();
            return Err(FlashError::WrongPartition { staging, got: partition }.into());
        }

        let sha256: [u8; 32] = hasher.finalize().into();
        if let Err(e) = verify(written, first_byte, &sha256, expect) {
            warn!("OTA: staged image in {} rejected: {}", staging, e);
            self.abort();
            return Err(e.into());
        }

        debug!("OTA: {} verified, {} bytes, sha256 {}", staging, written, hex::encode(sha256));
        Ok(FinalizedImage {
            partition: staging,
            length: written,
            sha256,
        })
    }

    /// Point the bootloader at the finalized image. Irreversible for this boot.
    pub fn activate(&mut self, image: FinalizedImage) -> Result<PartitionId, FlashError> {
        match self.stage {
            Stage::Staged { partition } if partition == image.partition => {}
            Stage::Staged { partition } => {
                return Err(FlashError::WrongPartition {
                    staging: partition,
                    got: image.partition,
                })
            }
            ref other => return Err(FlashError::InvalidState(other.name())),
        }

        if let Err(e) = self.storage.set_boot_target(&image) {
            self.abort();
            return Err(e);
        }

        info!(
            "OTA: boot partition set to {} ({} bytes, sha256 {})",
            image.partition,
            image.length,
            image.sha256_hex()
        );
        self.stage = Stage::Active {
            partition: image.partition,
        };
        self.status = OtaStatus::Ready;
        Ok(image.partition)
    }

    pub fn reboot_into(&mut self, partition: PartitionId) -> Result<(), FlashError> {
        match self.stage {
            Stage::Active { partition: active } if active == partition => {}
            ref other => return Err(FlashError::InvalidState(other.name())),
        }
        info!("OTA: restarting into {}", partition);
        self.storage.restart();
        // Only reached on backends that simulate the restart
        self.stage = Stage::Idle;
        self.status = OtaStatus::Idle;
        Ok(())
    }

    /// Drop the current session and leave the staging slot erased.
    pub fn abort(&mut self) {
        let slot = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Staging { partition, .. } | Stage::Staged { partition } => Some(partition),
            Stage::Active { partition } => {
                // Boot pointer already moved; nothing left to undo
                self.stage = Stage::Active { partition };
                return;
            }
            Stage::Idle => None,
        };
        if let Some(partition) = slot {
            if let Err(e) = self.storage.erase(partition) {
                warn!("OTA: could not erase {} after abort: {}", partition, e);
            }
            self.status = OtaStatus::Failed;
        }
        self.expected_size = None;
    }
}

impl<S: PartitionStorage> Drop for OtaApplier<S> {
    fn drop(&mut self) {
        // Clean up any ongoing OTA operation
        if matches!(self.stage, Stage::Staging { .. } | Stage::Staged { .. }) {
            self.abort();
        }
    }
}

fn verify(
    written: u64,
    first_byte: Option<u8>,
    sha256: &[u8; 32],
    expect: &ImageExpectation,
) -> Result<(), IntegrityError> {
    if written == 0 {
        return Err(IntegrityError::Empty);
    }
    if let Some(declared) = expect.length {
        if declared != written {
            return Err(IntegrityError::LengthMismatch {
                declared,
                received: written,
            });
        }
    }
    match first_byte {
        Some(IMAGE_MAGIC) => {}
        found => {
            return Err(IntegrityError::BadHeader {
                expected: IMAGE_MAGIC,
                found: found.unwrap_or(0),
            })
        }
    }
    if let Some(expected) = &expect.sha256 {
        if expected != sha256 {
            return Err(IntegrityError::DigestMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(sha256),
            });
        }
    }
    Ok(())
}
