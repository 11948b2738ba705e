use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::config::{ConfigStore, CONFIG_KEY, CONFIG_NAMESPACE};

/// Config blob in the default NVS partition.
pub struct NvsConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl ConfigStore for NvsConfigStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.nvs.blob_len(CONFIG_KEY)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len];
        let data = self.nvs.get_blob(CONFIG_KEY, &mut buf)?;
        Ok(data.map(|d| d.to_vec()))
    }

    fn save(&mut self, bytes: &[u8]) -> Result<()> {
        self.nvs.set_blob(CONFIG_KEY, bytes)?;
        Ok(())
    }
}
