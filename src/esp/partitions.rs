// Partition table access through the esp_partition / esp_ota C API

use core::ffi::c_void;

use anyhow::{anyhow, Result};
use esp_idf_sys::{
    esp, esp_ota_get_boot_partition, esp_ota_get_running_partition, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_partition_erase_range, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1, esp_partition_subtype_t, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, esp_partition_write, esp_restart,
};
use log::info;

use crate::error::FlashError;
use crate::ota::{FinalizedImage, PartitionId, PartitionInfo, PartitionStorage};

/// Pointer into the partition table, which is mapped for the program's lifetime.
#[derive(Clone, Copy)]
struct RawPartition(*const esp_partition_t);

// SAFETY: entries are immutable after boot and the C API is thread safe.
unsafe impl Send for RawPartition {}

impl RawPartition {
    fn address(self) -> u32 {
        unsafe { (*self.0).address }
    }

    fn size(self) -> u32 {
        unsafe { (*self.0).size }
    }
}

pub struct EspPartitions {
    factory: Option<RawPartition>,
    slot_a: RawPartition,
    slot_b: RawPartition,
}

impl EspPartitions {
    /// Fails if the partition table lacks either OTA slot.
    pub fn take() -> Result<Self> {
        let slot_a = find(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0)
            .ok_or_else(|| anyhow!("partition table has no ota_0"))?;
        let slot_b = find(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1)
            .ok_or_else(|| anyhow!("partition table has no ota_1"))?;
        let factory = find(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY);

        let partitions = Self { factory, slot_a, slot_b };
        info!(
            "Partitions: running {}, boot {}, slots {} KiB",
            partitions.running(),
            partitions.boot_target(),
            slot_a.size() / 1024
        );
        Ok(partitions)
    }

    fn raw(&self, id: PartitionId) -> Option<RawPartition> {
        match id {
            PartitionId::Factory => self.factory,
            PartitionId::SlotA => Some(self.slot_a),
            PartitionId::SlotB => Some(self.slot_b),
        }
    }

    fn identify(&self, p: *const esp_partition_t) -> PartitionId {
        if p.is_null() {
            return PartitionId::Factory;
        }
        let address = RawPartition(p).address();
        if address == self.slot_a.address() {
            PartitionId::SlotA
        } else if address == self.slot_b.address() {
            PartitionId::SlotB
        } else {
            PartitionId::Factory
        }
    }
}

fn find(subtype: esp_partition_subtype_t) -> Option<RawPartition> {
    let p = unsafe {
        esp_partition_find_first(esp_partition_type_t_ESP_PARTITION_TYPE_APP, subtype, core::ptr::null())
    };
    if p.is_null() {
        None
    } else {
        Some(RawPartition(p))
    }
}

impl PartitionStorage for EspPartitions {
    fn list_partitions(&self) -> Vec<PartitionInfo> {
        [PartitionId::Factory, PartitionId::SlotA, PartitionId::SlotB]
            .into_iter()
            .filter_map(|id| {
                self.raw(id).map(|p| PartitionInfo {
                    id,
                    size: u64::from(p.size()),
                })
            })
            .collect()
    }

    fn running(&self) -> PartitionId {
        self.identify(unsafe { esp_ota_get_running_partition() })
    }

    fn boot_target(&self) -> PartitionId {
        self.identify(unsafe { esp_ota_get_boot_partition() })
    }

    fn erase(&mut self, partition: PartitionId) -> Result<(), FlashError> {
        let p = self.raw(partition).ok_or(FlashError::NoStagingPartition)?;
        esp!(unsafe { esp_partition_erase_range(p.0, 0, p.size() as usize) }).map_err(|e| FlashError::Erase {
            partition,
            reason: e.to_string(),
        })
    }

    fn write(&mut self, partition: PartitionId, offset: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let p = self.raw(partition).ok_or(FlashError::NoStagingPartition)?;
        if offset + bytes.len() as u64 > u64::from(p.size()) {
            return Err(FlashError::Overflow {
                partition,
                capacity: u64::from(p.size()),
            });
        }
        esp!(unsafe { esp_partition_write(p.0, offset as usize, bytes.as_ptr() as *const c_void, bytes.len()) })
            .map_err(|e| FlashError::Write {
                partition,
                offset,
                reason: e.to_string(),
            })
    }

    fn set_boot_target(&mut self, image: &FinalizedImage) -> Result<(), FlashError> {
        let partition = image.partition();
        let p = self.raw(partition).ok_or(FlashError::NoStagingPartition)?;
        // esp_ota_set_boot_partition re-validates the app image header
        esp!(unsafe { esp_ota_set_boot_partition(p.0) }).map_err(|e| FlashError::SetBoot {
            partition,
            reason: e.to_string(),
        })
    }

    fn mark_running_valid(&mut self) -> Result<(), FlashError> {
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() }).map_err(|e| FlashError::Storage(e.to_string()))
    }

    fn restart(&mut self) {
        unsafe { esp_restart() };
    }
}
