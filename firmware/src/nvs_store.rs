use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::debug;

use coop_supervisor::KeyValueStore;

const NVS_NAMESPACE: &str = "supervisor";
const MAX_VALUE_LEN: usize = 64;

/// Small string values the supervisor keeps across reboots
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    pub fn new(nvs_partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl KeyValueStore for NvsStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let mut buffer = [0u8; MAX_VALUE_LEN];
        let value = self
            .nvs
            .get_str(key, &mut buffer)
            .map_err(|e| anyhow!("NVS read of '{}' failed: {}", key, e))?;
        Ok(value.map(str::to_string))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.nvs
            .set_str(key, value)
            .map_err(|e| anyhow!("NVS write of '{}' failed: {}", key, e))
    }

    // EspNvs commits inside every set
    fn commit(&mut self) -> Result<()> {
        debug!("💾 NVS namespace '{}' committed", NVS_NAMESPACE);
        Ok(())
    }
}
