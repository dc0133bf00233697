// Persistent Key-Value Storage
// String-keyed store (NVS on device) used to recognise the first boot after an update

use anyhow::Result;
use log::{info, warn};

const BOOT_PARTITION_KEY: &str = "boot_part";

pub trait KeyValueStore {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
}

/// Decide whether this is the first boot after an update was applied.
///
/// Only a software reset can follow an update. The stored boot partition address is
/// compared with the current one; a missing or different value means a new image is
/// running, and the store is updated so the next boot reports `false`.
pub fn detect_post_update_boot<K: KeyValueStore>(
    store: &mut K,
    boot_partition_address: u32,
    software_reset: bool,
) -> Result<bool> {
    if !software_reset {
        return Ok(false);
    }

    let current = format!("{:#010x}", boot_partition_address);
    let updated = match store.get(BOOT_PARTITION_KEY)? {
        None => {
            info!("📝 No saved boot partition address, recording {}", current);
            true
        }
        Some(saved) if saved != current => {
            info!("🆕 Boot partition changed {} -> {}: update detected", saved, current);
            true
        }
        Some(_) => {
            info!("📋 Boot partition unchanged, no update detected");
            false
        }
    };

    if updated {
        if let Err(e) = store.set(BOOT_PARTITION_KEY, &current).and_then(|_| store.commit()) {
            warn!("⚠️ Failed to save boot partition address: {}", e);
        }
    }

    Ok(updated)
}
