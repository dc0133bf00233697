// HTTPS Firmware Transport
// Streams a firmware image over TLS into the inactive OTA partition through esp_https_ota.
// The supervisor owns the step loop, retry counting and progress reporting.

use std::ffi::CString;
use std::ptr;

use anyhow::{anyhow, Result};
use embassy_time::Duration;
use esp_idf_svc::sys::{self, EspError};
use log::{info, warn};

use coop_supervisor::{SecureUpdater, StepStatus};

/// One in-flight download. The HTTP client keeps pointers into the URL and
/// certificate for its whole lifetime, so the session owns both strings.
pub struct OtaSession {
    raw: sys::esp_https_ota_handle_t,
    _url: CString,
    _trust_anchor: CString,
}

#[derive(Default)]
pub struct HttpsUpdater;

impl HttpsUpdater {
    pub fn new() -> Self {
        Self
    }
}

impl SecureUpdater for HttpsUpdater {
    type Handle = OtaSession;

    fn begin(&mut self, locator: &str, trust_anchor: &str, timeout: Duration) -> Result<OtaSession> {
        let url = CString::new(locator).map_err(|e| anyhow!("Update locator contains null bytes: {}", e))?;
        let trust_anchor =
            CString::new(trust_anchor).map_err(|e| anyhow!("Trust anchor contains null bytes: {}", e))?;

        let http_config = sys::esp_http_client_config_t {
            url: url.as_ptr(),
            cert_pem: trust_anchor.as_ptr(),
            timeout_ms: timeout.as_millis().min(i32::MAX as u64) as i32,
            keep_alive_enable: true,
            ..Default::default()
        };
        let ota_config = sys::esp_https_ota_config_t {
            http_config: &http_config,
            ..Default::default()
        };

        let mut raw: sys::esp_https_ota_handle_t = ptr::null_mut();
        EspError::convert(unsafe { sys::esp_https_ota_begin(&ota_config, &mut raw) })
            .map_err(|e| anyhow!("HTTPS OTA begin failed: {}", e))?;

        let image_size = unsafe { sys::esp_https_ota_get_image_size(raw) };
        info!("⬇️ Firmware download started ({} bytes)", image_size);

        Ok(OtaSession {
            raw,
            _url: url,
            _trust_anchor: trust_anchor,
        })
    }

    fn perform_step(&mut self, session: &mut OtaSession) -> Result<StepStatus> {
        let result = unsafe { sys::esp_https_ota_perform(session.raw) };
        if result == sys::ESP_ERR_HTTPS_OTA_IN_PROGRESS as i32 {
            return Ok(StepStatus::InProgress);
        }
        EspError::convert(result).map_err(|e| anyhow!("HTTPS OTA step failed: {}", e))?;
        Ok(StepStatus::Done)
    }

    fn is_complete(&self, session: &OtaSession) -> bool {
        unsafe { sys::esp_https_ota_is_complete_data_received(session.raw) }
    }

    fn finish(&mut self, session: OtaSession) -> Result<()> {
        let result = unsafe { sys::esp_https_ota_finish(session.raw) };
        EspError::convert(result).map_err(|e| anyhow!("HTTPS OTA finish failed: {}", e))?;
        info!("✅ Firmware image verified");
        Ok(())
    }

    fn abort(&mut self, session: OtaSession) {
        let result = unsafe { sys::esp_https_ota_abort(session.raw) };
        if let Err(e) = EspError::convert(result) {
            warn!("⚠️ HTTPS OTA abort reported: {}", e);
        }
    }

    fn commit_boot_target(&mut self) -> Result<()> {
        let partition = unsafe { sys::esp_ota_get_next_update_partition(ptr::null()) };
        if partition.is_null() {
            return Err(anyhow!("No OTA update partition available"));
        }

        EspError::convert(unsafe { sys::esp_ota_set_boot_partition(partition) })
            .map_err(|e| anyhow!("Setting boot partition failed: {}", e))?;

        let address = unsafe { (*partition).address };
        info!("🧭 Boot partition set to {:#010x}", address);
        Ok(())
    }
}
