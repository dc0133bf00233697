use coop_supervisor::DeviceIdentity;
use esp_idf_svc::sys;

/// Station MAC burned into efuse; the key the broker side addresses this device by
pub fn device_identity() -> DeviceIdentity {
    let mut mac = [0u8; 6];
    unsafe {
        sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    DeviceIdentity::from_mac(mac)
}

/// Flash address of the partition the bootloader will start next
pub fn boot_partition_address() -> Option<u32> {
    let partition = unsafe { sys::esp_ota_get_boot_partition() };
    if partition.is_null() {
        return None;
    }
    Some(unsafe { (*partition).address })
}

pub fn running_partition_label() -> String {
    let partition = unsafe { sys::esp_ota_get_running_partition() };
    if partition.is_null() {
        return "unknown".to_string();
    }
    let label = unsafe { core::ffi::CStr::from_ptr((*partition).label.as_ptr()) };
    label.to_string_lossy().into_owned()
}

/// Only a software reset can follow an applied update
pub fn was_software_reset() -> bool {
    let reason = unsafe { sys::esp_reset_reason() };
    reason == sys::esp_reset_reason_t_ESP_RST_SW
}
