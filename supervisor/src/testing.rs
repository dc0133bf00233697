// In-memory collaborators for host tests

use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::{anyhow, Result};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Duration;

use crate::audio::{AudioDevice, DecodedFrame};
use crate::broker::{BrokerClient, QoS};
use crate::config::SupervisorConfig;
use crate::context::SupervisorContext;
use crate::identity::DeviceIdentity;
use crate::indicator::PwmOutputs;
use crate::ota::{SecureUpdater, StepStatus};
use crate::storage::KeyValueStore;
use crate::system::SystemControl;

pub const TEST_DEVICE_ID: &str = "24:6f:28:ab:01:fe";

pub type TestContext = SupervisorContext<MockBroker, MockUpdater, MockSystem>;

pub fn test_context(config: SupervisorConfig) -> TestContext {
    let _ = env_logger::builder().is_test(true).try_init();
    SupervisorContext::new(
        config,
        DeviceIdentity::new(TEST_DEVICE_ID),
        MockBroker::default(),
        MockUpdater::default(),
        "test-root-ca",
        MockSystem::default(),
    )
}

#[derive(Debug, Default)]
pub struct MockBroker {
    pub subscribed: Vec<String>,
    pub published: Vec<(String, Vec<u8>, QoS)>,
    pub publish_attempts: u32,
    /// Number of upcoming publishes that fail
    pub fail_publishes: u32,
    pub reconnects: u32,
    /// Number of upcoming reconnects that fail
    pub fail_reconnects: u32,
    pub stops: u32,
    pub fail_stop: bool,
}

impl BrokerClient for MockBroker {
    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<()> {
        self.subscribed.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<()> {
        self.publish_attempts += 1;
        if self.fail_publishes > 0 {
            self.fail_publishes -= 1;
            return Err(anyhow!("publish rejected"));
        }
        self.published.push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        if self.fail_reconnects > 0 {
            self.fail_reconnects -= 1;
            return Err(anyhow!("reconnect failed"));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stops += 1;
        if self.fail_stop {
            return Err(anyhow!("stop failed"));
        }
        Ok(())
    }
}

/// Shareable across threads so update and render loops can run side by side
pub struct MockSystem {
    calls: Mutex<CriticalSectionRawMutex, RefCell<Vec<&'static str>>>,
    network_active: AtomicBool,
}

impl Default for MockSystem {
    fn default() -> Self {
        Self {
            calls: Mutex::new(RefCell::new(Vec::new())),
            network_active: AtomicBool::new(true),
        }
    }
}

impl MockSystem {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock(|calls| calls.borrow().clone())
    }

    pub fn restarts(&self) -> usize {
        self.calls().iter().filter(|call| **call == "restart").count()
    }

    pub fn set_network_active(&self, active: bool) {
        self.network_active.store(active, Ordering::Relaxed);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock(|calls| calls.borrow_mut().push(call));
    }
}

impl SystemControl for MockSystem {
    fn network_active(&self) -> bool {
        self.network_active.load(Ordering::Relaxed)
    }

    fn release_network(&self) {
        self.record("release_network");
    }

    fn restart(&self) {
        self.record("restart");
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
    pub commits: u32,
}

impl KeyValueStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockUpdater {
    pub begins: Vec<String>,
    pub last_trust_anchor: Option<String>,
    pub last_timeout: Option<Duration>,
    pub fail_begin: bool,
    /// Steps reporting `InProgress` before `Done`
    pub in_progress_steps: u32,
    /// Number of upcoming steps that fail
    pub fail_steps: u32,
    pub step_calls: u32,
    /// Blocks the calling thread inside every step, like a network read
    pub step_sleep: Option<std::time::Duration>,
    pub report_incomplete: bool,
    pub finishes: u32,
    pub aborts: u32,
    pub commits: u32,
    next_handle: u32,
    done: bool,
}

impl SecureUpdater for MockUpdater {
    type Handle = u32;

    fn begin(&mut self, locator: &str, trust_anchor: &str, timeout: Duration) -> Result<u32> {
        if self.fail_begin {
            return Err(anyhow!("connection refused"));
        }
        self.begins.push(locator.to_string());
        self.last_trust_anchor = Some(trust_anchor.to_string());
        self.last_timeout = Some(timeout);
        self.done = false;
        self.next_handle += 1;
        Ok(self.next_handle)
    }

    fn perform_step(&mut self, _handle: &mut u32) -> Result<StepStatus> {
        self.step_calls += 1;
        if let Some(pause) = self.step_sleep {
            std::thread::sleep(pause);
        }
        if self.fail_steps > 0 {
            self.fail_steps -= 1;
            return Err(anyhow!("read timeout"));
        }
        if self.in_progress_steps > 0 {
            self.in_progress_steps -= 1;
            return Ok(StepStatus::InProgress);
        }
        self.done = true;
        Ok(StepStatus::Done)
    }

    fn is_complete(&self, _handle: &u32) -> bool {
        self.done && !self.report_incomplete
    }

    fn finish(&mut self, _handle: u32) -> Result<()> {
        self.finishes += 1;
        Ok(())
    }

    fn abort(&mut self, _handle: u32) {
        self.aborts += 1;
    }

    fn commit_boot_target(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }
}

/// Clip "decoder" producing one 1000-valued sample per two input bytes
#[derive(Debug, Default)]
pub struct MockAudio {
    clip: Vec<u8>,
    frame_bytes: usize,
    pub clip_loads: u32,
    pub writes: Vec<Vec<i16>>,
    pub gain_settings: Vec<bool>,
    pub mute_settings: Vec<bool>,
    pub fail_writes: bool,
    /// Called once, during the first sample write
    pub on_first_write: Option<fn()>,
}

impl MockAudio {
    pub fn with_clip(clip: Vec<u8>, frame_bytes: usize) -> Self {
        Self {
            clip,
            frame_bytes,
            ..Default::default()
        }
    }
}

impl AudioDevice for MockAudio {
    fn load_alert_clip(&mut self) -> Result<Vec<u8>> {
        self.clip_loads += 1;
        Ok(self.clip.clone())
    }

    fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.mute_settings.push(muted);
        Ok(())
    }

    fn set_high_gain(&mut self, high: bool) -> Result<()> {
        self.gain_settings.push(high);
        Ok(())
    }

    fn decode_frame(&mut self, data: &[u8]) -> Result<Option<DecodedFrame>> {
        if data.is_empty() {
            return Ok(None);
        }
        let consumed = self.frame_bytes.min(data.len());
        Ok(Some(DecodedFrame {
            consumed,
            samples: vec![1000; consumed / 2],
        }))
    }

    fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        if let Some(hook) = self.on_first_write.take() {
            hook();
        }
        if self.fail_writes {
            return Err(anyhow!("i2s write failed"));
        }
        self.writes.push(samples.to_vec());
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockPwm {
    max: u32,
    pub frames: Vec<[u32; 3]>,
    /// Number of upcoming writes that fail
    pub fail_writes: u32,
}

impl MockPwm {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            frames: Vec::new(),
            fail_writes: 0,
        }
    }
}

impl PwmOutputs for MockPwm {
    fn max_duty(&self) -> u32 {
        self.max
    }

    fn set_duties(&mut self, duties: [u32; 3]) -> Result<()> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(anyhow!("ledc write failed"));
        }
        self.frames.push(duties);
        Ok(())
    }
}
