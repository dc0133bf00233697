// Supervisor Configuration Module
// Runtime configuration injected at startup: topics, timings, retry bounds and recovery policies
// Every deployment runs the same supervisor logic; only this value differs

use anyhow::{anyhow, Result};
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

// Defaults taken from the field-proven firmware behaviour
const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = 2 * 60 * 60; // 2 hours of broker silence
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
const DEFAULT_OTA_MAX_RETRIES: u32 = 5;
const DEFAULT_OTA_PROGRESS_INTERVAL: u32 = 100; // streaming steps between progress reports
const DEFAULT_OTA_STEP_DELAY_MS: u64 = 1000;
const DEFAULT_OTA_OPERATION_TIMEOUT_MS: u64 = 30000;
const DEFAULT_INDICATOR_PERIOD_MS: u64 = 25;
const DEFAULT_FLASH_HALF_PERIOD_MS: u64 = 500; // 1 Hz full on / full off
const DEFAULT_PULSE_STEP_PERMILLE: u32 = 20; // 50 ticks from dark to full brightness
const DEFAULT_PWM_MAX_DUTY: u32 = 8191; // 13-bit LEDC resolution
const DEFAULT_AUDIO_PLAYS_PER_ALERT: u32 = 3;
const DEFAULT_SELF_TEST_ITERATIONS: u32 = 3;
const DEFAULT_SELF_TEST_STEP_MS: u64 = 5000;
const DEFAULT_PUBLISH_RETRIES: u32 = 3;

/// What the liveness watchdog does when the broker has been silent for too long
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPolicy {
    /// Show the orphaned pattern and sound the alert, leave the device running
    AlertOrphaned,
    /// Stop the broker client, release Wi-Fi and restart
    Reboot,
}

/// What the router does on disconnect when the network transport is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveTransportPolicy {
    /// Reboot immediately without attempting a reconnect
    Reboot,
    /// Treat the inactive transport as a failed attempt and keep waiting, within the attempt cap
    Retry,
}

/// Broker topic names (one set per deployment)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub status: String,
    pub update_request: String,
    pub self_test_request: String,
    pub status_request: String,
    pub ota_progress: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            status: "coop/status".to_string(),
            update_request: "coop/ota/update".to_string(),
            self_test_request: "coop/self-test".to_string(),
            status_request: "coop/status/request".to_string(),
            ota_progress: "coop/ota/progress".to_string(),
        }
    }
}

impl TopicConfig {
    /// Topics the router subscribes to on every connect
    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.status, &self.update_request, &self.self_test_request]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub topics: TopicConfig,
    pub hostname: String, // key used in progress / completion payloads
    pub watchdog_timeout_secs: u64,
    pub watchdog_policy: WatchdogPolicy,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub inactive_transport_policy: InactiveTransportPolicy,
    pub ota_max_retries: u32,
    pub ota_progress_interval: u32,
    pub ota_step_delay_ms: u64,
    pub ota_operation_timeout_ms: u64,
    pub indicator_period_ms: u64,
    pub flash_half_period_ms: u64,
    pub pulse_step_permille: u32,
    pub pwm_max_duty: u32,
    pub audio_volume: f32, // 0.0 - 1.0, applied to decoded samples
    pub audio_high_gain: bool,
    pub audio_plays_per_alert: u32,
    pub self_test_iterations: u32,
    pub self_test_step_ms: u64,
    pub publish_retries: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            topics: TopicConfig::default(),
            hostname: "coop-monitor".to_string(),
            watchdog_timeout_secs: DEFAULT_WATCHDOG_TIMEOUT_SECS,
            watchdog_policy: WatchdogPolicy::AlertOrphaned,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            inactive_transport_policy: InactiveTransportPolicy::Reboot,
            ota_max_retries: DEFAULT_OTA_MAX_RETRIES,
            ota_progress_interval: DEFAULT_OTA_PROGRESS_INTERVAL,
            ota_step_delay_ms: DEFAULT_OTA_STEP_DELAY_MS,
            ota_operation_timeout_ms: DEFAULT_OTA_OPERATION_TIMEOUT_MS,
            indicator_period_ms: DEFAULT_INDICATOR_PERIOD_MS,
            flash_half_period_ms: DEFAULT_FLASH_HALF_PERIOD_MS,
            pulse_step_permille: DEFAULT_PULSE_STEP_PERMILLE,
            pwm_max_duty: DEFAULT_PWM_MAX_DUTY,
            audio_volume: 1.0,
            audio_high_gain: true,
            audio_plays_per_alert: DEFAULT_AUDIO_PLAYS_PER_ALERT,
            self_test_iterations: DEFAULT_SELF_TEST_ITERATIONS,
            self_test_step_ms: DEFAULT_SELF_TEST_STEP_MS,
            publish_retries: DEFAULT_PUBLISH_RETRIES,
        }
    }
}

impl SupervisorConfig {
    /// Parse a JSON override; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SupervisorConfig = serde_json::from_str(json)
            .map_err(|e| anyhow!("Failed to parse supervisor config JSON: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values are within workable ranges
    pub fn validate(&self) -> Result<()> {
        if self.watchdog_timeout_secs == 0 {
            return Err(anyhow!("Watchdog timeout must be greater than zero"));
        }

        if self.reconnect_max_attempts == 0 {
            return Err(anyhow!("Reconnect attempts must be at least 1"));
        }

        if self.ota_progress_interval == 0 {
            return Err(anyhow!("OTA progress interval must be at least 1 step"));
        }

        if !(20..=30).contains(&self.indicator_period_ms) {
            return Err(anyhow!("Indicator period must be between 20 and 30 ms"));
        }

        if self.flash_half_period_ms < self.indicator_period_ms {
            return Err(anyhow!("Flash half-period cannot be shorter than the indicator period"));
        }

        if self.pulse_step_permille == 0 || self.pulse_step_permille > 1000 {
            return Err(anyhow!("Pulse step must be between 1 and 1000 permille"));
        }

        if self.pwm_max_duty == 0 {
            return Err(anyhow!("PWM max duty must be greater than zero"));
        }

        if !(0.0..=1.0).contains(&self.audio_volume) {
            return Err(anyhow!("Audio volume must be between 0.0 and 1.0"));
        }

        let topics = &self.topics;
        for (name, topic) in [
            ("status", &topics.status),
            ("update_request", &topics.update_request),
            ("self_test_request", &topics.self_test_request),
            ("status_request", &topics.status_request),
            ("ota_progress", &topics.ota_progress),
        ] {
            if topic.is_empty() {
                return Err(anyhow!("Topic '{}' must not be empty", name));
            }
        }

        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ota_step_delay(&self) -> Duration {
        Duration::from_millis(self.ota_step_delay_ms)
    }

    pub fn ota_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.ota_operation_timeout_ms)
    }

    pub fn indicator_period(&self) -> Duration {
        Duration::from_millis(self.indicator_period_ms)
    }

    pub fn self_test_step(&self) -> Duration {
        Duration::from_millis(self.self_test_step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_field_behaviour() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.watchdog_timeout(), Duration::from_secs(7200));
        assert_eq!(config.reconnect_max_attempts, 5);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.ota_max_retries, 5);
        assert_eq!(config.ota_progress_interval, 100);
        assert_eq!(config.watchdog_policy, WatchdogPolicy::AlertOrphaned);
        assert_eq!(config.inactive_transport_policy, InactiveTransportPolicy::Reboot);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SupervisorConfig::from_json(
            r#"{"hostname":"farm-house","watchdog_policy":"reboot","topics":{"status":"farm/status"}}"#,
        )
        .unwrap();

        assert_eq!(config.hostname, "farm-house");
        assert_eq!(config.watchdog_policy, WatchdogPolicy::Reboot);
        assert_eq!(config.topics.status, "farm/status");
        assert_eq!(config.topics.update_request, "coop/ota/update");
        assert_eq!(config.reconnect_max_attempts, 5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = SupervisorConfig::default();
        config.indicator_period_ms = 100;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.audio_volume = 1.5;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.topics.self_test_request.clear();
        assert!(config.validate().is_err());

        assert!(SupervisorConfig::from_json("{not json").is_err());
    }

    #[test]
    fn subscriptions_cover_the_three_inbound_topics() {
        let topics = TopicConfig::default();
        assert_eq!(
            topics.subscriptions(),
            ["coop/status", "coop/ota/update", "coop/self-test"]
        );
    }
}
