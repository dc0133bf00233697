// Deployment Configuration Storage
// Per-site settings (broker endpoint, credentials, certificates, supervisor tuning) read from
// NVS flash at startup. Provisioning writes the same keys, so a single firmware image serves
// every coop.

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use coop_supervisor::SupervisorConfig;

const NVS_NAMESPACE: &str = "deployment";
const BROKER_URI_KEY: &str = "broker_uri";
const LOCATION_KEY: &str = "location";
const HOSTNAME_KEY: &str = "hostname";
const WIFI_SSID_KEY: &str = "wifi_ssid";
const WIFI_PASSWORD_KEY: &str = "wifi_pass";
const CLIENT_CERT_KEY: &str = "client_cert";
const CLIENT_KEY_KEY: &str = "client_key";
const TRUST_ANCHOR_KEY: &str = "trust_anchor";
const SUPERVISOR_KEY: &str = "supervisor";

// PEM blobs are the largest values kept in this namespace
const SHORT_VALUE_LEN: usize = 256;
const PEM_VALUE_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub broker_uri: String,
    pub location: String,
    pub hostname: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub client_certificate: String,
    pub private_key: String,
    pub trust_anchor: String,
    pub supervisor: SupervisorConfig,
}

impl DeploymentConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.broker_uri.starts_with("mqtts://") {
            return Err(anyhow!("Broker URI must use mqtts://, got {}", self.broker_uri));
        }
        if self.wifi_ssid.is_empty() || self.wifi_ssid.len() > 32 {
            return Err(anyhow!("WiFi SSID must be 1-32 bytes"));
        }
        for (name, pem) in [
            ("client certificate", &self.client_certificate),
            ("private key", &self.private_key),
            ("trust anchor", &self.trust_anchor),
        ] {
            if !pem.contains("-----BEGIN") {
                return Err(anyhow!("{} is not PEM encoded", name));
            }
        }
        self.supervisor.validate()
    }
}

pub struct DeploymentStorage {
    nvs: EspNvs<NvsDefault>,
}

impl DeploymentStorage {
    pub fn new(nvs_partition: EspDefaultNvsPartition) -> Result<Self> {
        info!("🗄️ Opening deployment configuration namespace");
        let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    /// Read and validate the full deployment record
    pub fn load(&self) -> Result<DeploymentConfig> {
        let location = self.optional(LOCATION_KEY, SHORT_VALUE_LEN)?.unwrap_or_default();

        let mut supervisor = match self.optional(SUPERVISOR_KEY, PEM_VALUE_LEN)? {
            Some(json) => {
                info!("⚙️ Applying stored supervisor overrides");
                SupervisorConfig::from_json(&json)?
            }
            None => {
                debug!("No supervisor overrides stored, using defaults");
                SupervisorConfig::default()
            }
        };
        if let Some(hostname) = self.optional(HOSTNAME_KEY, SHORT_VALUE_LEN)? {
            supervisor.hostname = hostname;
        }

        let config = DeploymentConfig {
            broker_uri: self.required(BROKER_URI_KEY, SHORT_VALUE_LEN)?,
            hostname: supervisor.hostname.clone(),
            location,
            wifi_ssid: self.required(WIFI_SSID_KEY, SHORT_VALUE_LEN)?,
            wifi_password: self.optional(WIFI_PASSWORD_KEY, SHORT_VALUE_LEN)?.unwrap_or_default(),
            client_certificate: self.required(CLIENT_CERT_KEY, PEM_VALUE_LEN)?,
            private_key: self.required(CLIENT_KEY_KEY, PEM_VALUE_LEN)?,
            trust_anchor: self.required(TRUST_ANCHOR_KEY, PEM_VALUE_LEN)?,
            supervisor,
        };
        config.validate()?;

        info!("📋 Deployment configuration loaded:");
        info!("  🏠 Location: {}", config.location);
        info!("  🏷️ Hostname: {}", config.hostname);
        info!("  🌐 Broker: {}", config.broker_uri);
        info!(
            "  📜 Client certificate fingerprint: {}",
            certificate_fingerprint(&config.client_certificate)
        );

        Ok(config)
    }

    fn required(&self, key: &str, max_len: usize) -> Result<String> {
        self.optional(key, max_len)?
            .ok_or_else(|| anyhow!("Deployment key '{}' is not provisioned", key))
    }

    fn optional(&self, key: &str, max_len: usize) -> Result<Option<String>> {
        let mut buffer = vec![0u8; max_len];
        match self.nvs.get_str(key, &mut buffer) {
            Ok(value) => Ok(value.map(str::to_string)),
            Err(e) => {
                warn!("⚠️ Failed to read deployment key '{}': {:?}", key, e);
                Err(anyhow!("Failed to read deployment key '{}': {}", key, e))
            }
        }
    }
}

/// SHA256 fingerprint, logged so an operator can match the device to its registration
fn certificate_fingerprint(certificate: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(certificate.as_bytes());
    format!("{:x}", hasher.finalize())
}
