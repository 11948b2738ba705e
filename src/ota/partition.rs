//! Dual-bank partition model and the storage collaborator interface.

use std::fmt;

use serde::Serialize;

use super::applier::FinalizedImage;
use crate::error::FlashError;

/// Application partitions known to the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionId {
    Factory,
    SlotA,
    SlotB,
}

impl PartitionId {
    pub fn is_ota_slot(self) -> bool {
        !matches!(self, PartitionId::Factory)
    }

    pub fn label(self) -> &'static str {
        match self {
            PartitionId::Factory => "factory",
            PartitionId::SlotA => "ota_0",
            PartitionId::SlotB => "ota_1",
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// Holds the image that runs now or will run after the next restart
    Bootable,
    /// Free to be erased and written
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub size: u64,
}

/// Boot/partition subsystem of the device.
///
/// `set_boot_target` takes a [`FinalizedImage`], which only
/// [`OtaApplier::finalize`](super::OtaApplier::finalize) can produce; nothing
/// else in the crate can move the boot pointer.
pub trait PartitionStorage: Send {
    fn list_partitions(&self) -> Vec<PartitionInfo>;

    /// Partition the current image was booted from.
    fn running(&self) -> PartitionId;

    /// Partition the bootloader will start next.
    fn boot_target(&self) -> PartitionId;

    fn erase(&mut self, partition: PartitionId) -> Result<(), FlashError>;

    fn write(&mut self, partition: PartitionId, offset: u64, bytes: &[u8]) -> Result<(), FlashError>;

    fn set_boot_target(&mut self, image: &FinalizedImage) -> Result<(), FlashError>;

    /// Cancel the bootloader's pending rollback for the running image.
    fn mark_running_valid(&mut self) -> Result<(), FlashError>;

    /// Restart the device. Never returns on hardware.
    fn restart(&mut self);
}

/// Role of `id` given the current boot state.
pub fn role_of(storage: &dyn PartitionStorage, id: PartitionId) -> PartitionRole {
    if id == storage.running() || id == storage.boot_target() || !id.is_ota_slot() {
        PartitionRole::Bootable
    } else {
        PartitionRole::Staging
    }
}
