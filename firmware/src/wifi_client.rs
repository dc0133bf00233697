// Import Embassy time utilities for async delays
use embassy_time::{Duration, Timer};

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::EspError;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

use log::{error, info, warn};

use std::net::Ipv4Addr;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_DELAY: Duration = Duration::from_secs(5);

// Station-mode Wi-Fi used as the transport for the broker connection
pub struct WiFiClient {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WiFiClient {
    pub fn new(
        modem: impl Peripheral<P = esp_idf_svc::hal::modem::Modem> + 'static,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self, EspError> {
        info!("📶 Initializing WiFi station");

        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let wifi = BlockingWifi::wrap(wifi, sys_loop)?;

        Ok(Self { wifi })
    }

    pub async fn connect(&mut self, ssid: &str, password: &str, hostname: &str) -> Result<Ipv4Addr, EspError> {
        info!("📶 Connecting to WiFi network: {}", ssid);

        let wifi_config = Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| {
                error!("❌ Invalid SSID format");
                EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>()
            })?,
            password: password.try_into().map_err(|_| {
                error!("❌ Invalid password format");
                EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>()
            })?,
            channel: None,
            auth_method: auth_method_for(password),
            ..Default::default()
        });

        self.wifi.set_configuration(&wifi_config)?;
        if let Err(e) = self.wifi.wifi_mut().sta_netif_mut().set_hostname(hostname) {
            warn!("⚠️ Failed to set hostname {}: {:?}", hostname, e);
        }
        self.wifi.start()?;

        for attempt in 1..=CONNECT_ATTEMPTS {
            info!("📶 Connection attempt {} of {}", attempt, CONNECT_ATTEMPTS);

            match self.try_connect().await {
                Ok(ip) => {
                    info!("✅ WiFi connected. IP: {}", ip);
                    return Ok(ip);
                }
                Err(e) => {
                    warn!("⚠️ Connection attempt {} failed: {:?}", attempt, e);
                    if attempt < CONNECT_ATTEMPTS {
                        Timer::after(RETRY_DELAY).await;
                    }
                }
            }
        }

        error!("❌ All WiFi connection attempts failed");
        Err(EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_TIMEOUT }>())
    }

    async fn try_connect(&mut self) -> Result<Ipv4Addr, EspError> {
        self.wifi.connect()?;

        let start_time = std::time::Instant::now();
        while start_time.elapsed() < CONNECT_TIMEOUT.into() {
            if self.wifi.is_connected()? && self.wifi.is_up()? {
                let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
                return Ok(ip_info.ip);
            }

            Timer::after(Duration::from_millis(500)).await;
        }

        warn!("⏰ Connection timeout reached");
        Err(EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_TIMEOUT }>())
    }

    pub fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    /// Disconnect and stop the radio
    pub fn release(&mut self) -> Result<(), EspError> {
        info!("📴 Releasing WiFi");

        if self.wifi.is_connected()? {
            self.wifi.disconnect()?;
        }
        self.wifi.stop()?;
        Ok(())
    }
}

fn auth_method_for(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}
