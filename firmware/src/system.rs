// System Control
// Station interface ownership for recovery and the chip reset line

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use log::{info, warn};

use coop_supervisor::SystemControl;

use crate::wifi_client::WiFiClient;

pub struct EspSystem {
    wifi: Mutex<CriticalSectionRawMutex, RefCell<WiFiClient>>,
}

impl EspSystem {
    pub fn new(wifi: WiFiClient) -> Self {
        Self {
            wifi: Mutex::new(RefCell::new(wifi)),
        }
    }
}

impl SystemControl for EspSystem {
    fn network_active(&self) -> bool {
        self.wifi.lock(|wifi| wifi.borrow().is_connected())
    }

    fn release_network(&self) {
        self.wifi.lock(|wifi| {
            if let Err(e) = wifi.borrow_mut().release() {
                warn!("⚠️ WiFi release failed: {:?}", e);
            }
        });
    }

    fn restart(&self) {
        info!("🔄 Restarting device");
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }
}
