// OTA Lifecycle Manager
// Resolves the update locator for this device, enforces single-flight and drives the
// secure-update collaborator with bounded retries and periodic progress reports

mod task_slot;

pub use task_slot::{TaskSlot, TaskState};

use anyhow::{anyhow, Result};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::broker::{publish_with_retries, BrokerClient, QoS};
use crate::context::SupervisorContext;
use crate::error::SupervisorError;
use crate::identity::{parse_keyed_message, DeviceIdentity};
use crate::indicator::Indicator;
use crate::system::SystemControl;

/// Payload asking the broker side to republish the current device status
pub const STATUS_REQUEST_PAYLOAD: &[u8] = br#"{"message":"status_request"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    InProgress,
    Done,
}

/// Secure firmware download and apply (HTTPS OTA on device)
pub trait SecureUpdater {
    type Handle;

    fn begin(&mut self, locator: &str, trust_anchor: &str, timeout: Duration) -> Result<Self::Handle>;
    fn perform_step(&mut self, handle: &mut Self::Handle) -> Result<StepStatus>;
    fn is_complete(&self, handle: &Self::Handle) -> bool;
    /// Validate and close the written image. Consumes the handle on success and failure.
    fn finish(&mut self, handle: Self::Handle) -> Result<()>;
    /// Release an unfinished session
    fn abort(&mut self, handle: Self::Handle);
    fn commit_boot_target(&mut self) -> Result<()>;
}

/// Open update session; aborted on drop unless finished
struct UpdateSession<'a, U: SecureUpdater> {
    updater: &'a mut U,
    handle: Option<U::Handle>,
}

impl<U: SecureUpdater> UpdateSession<'_, U> {
    fn step(&mut self) -> Result<StepStatus> {
        match self.handle.as_mut() {
            Some(handle) => self.updater.perform_step(handle),
            None => Err(anyhow!("Update session already closed")),
        }
    }

    fn is_complete(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| self.updater.is_complete(handle))
            .unwrap_or(false)
    }

    fn finish(mut self) -> Result<()> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("Update session already closed"))?;
        self.updater.finish(handle)
    }
}

impl<U: SecureUpdater> Drop for UpdateSession<'_, U> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("🧹 Releasing unfinished update session");
            self.updater.abort(handle);
        }
    }
}

pub struct OtaManager<U: SecureUpdater> {
    identity: DeviceIdentity,
    trust_anchor: String,
    slot: TaskSlot<String>,
    updater: Mutex<CriticalSectionRawMutex, U>,
}

impl<U: SecureUpdater> OtaManager<U> {
    pub fn new(identity: DeviceIdentity, trust_anchor: impl Into<String>, updater: U) -> Self {
        Self {
            identity,
            trust_anchor: trust_anchor.into(),
            slot: TaskSlot::new(),
            updater: Mutex::new(updater),
        }
    }

    pub fn state(&self) -> TaskState {
        self.slot.state()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_running()
    }

    pub fn updater(&self) -> &Mutex<CriticalSectionRawMutex, U> {
        &self.updater
    }

    /// Accept or reject an update-request message.
    ///
    /// The payload maps device identities to update locators. On acceptance the sticky
    /// update indicator is shown and the locator is handed to the update task.
    pub fn request_update(&self, payload: &[u8], indicator: &Indicator) -> Result<(), SupervisorError> {
        let message = parse_keyed_message(payload)?;
        let locator = match self.identity.lookup(&message)? {
            Value::String(locator) if !locator.is_empty() => locator.clone(),
            _ => return Err(SupervisorError::malformed("update locator is not a non-empty string")),
        };

        self.slot.spawn(locator.clone())?;
        indicator.set_update_in_progress();
        info!("📥 Update accepted: {}", locator);
        Ok(())
    }

    /// Cancel a running update and wait for its session to be released
    pub async fn cancel_and_join(&self) -> bool {
        self.slot.cancel_and_join().await
    }
}

/// Elapsed time in progress reports, `MM:SS`
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02} elapsed...", secs / 60, secs % 60)
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// `{"<hostname>": "<text>"}`, the shape every OTA progress message uses
pub fn hostname_message(hostname: &str, text: &str) -> Vec<u8> {
    let mut map = Map::new();
    map.insert(hostname.to_string(), Value::String(text.to_string()));
    Value::Object(map).to_string().into_bytes()
}

async fn publish_progress<B, U, S>(ctx: &SupervisorContext<B, U, S>, text: &str)
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    let payload = hostname_message(&ctx.config.hostname, text);
    if let Err(e) = publish_with_retries(
        &ctx.broker,
        &ctx.config.topics.ota_progress,
        &payload,
        QoS::AtLeastOnce,
        ctx.config.publish_retries,
    )
    .await
    {
        warn!("⚠️ Failed to publish OTA progress: {}", e);
    }
}

/// Body of one update attempt. Returns true once the new image is committed.
async fn perform_update<B, U, S>(ctx: &SupervisorContext<B, U, S>, locator: &str) -> bool
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    let config = &ctx.config;
    let started = Instant::now();
    let mut updater = ctx.ota.updater.lock().await;

    let handle = match updater.begin(locator, &ctx.ota.trust_anchor, config.ota_operation_timeout()) {
        Ok(handle) => handle,
        Err(e) => {
            error!("❌ Failed to start update: {}", e);
            return false;
        }
    };
    let mut session = UpdateSession {
        updater: &mut *updater,
        handle: Some(handle),
    };

    let mut retries = 0;
    let mut steps: u32 = 0;
    loop {
        match session.step() {
            Ok(StepStatus::InProgress) => {
                if steps % config.ota_progress_interval == 0 {
                    let elapsed = format_elapsed(started.elapsed());
                    warn!("📦 Copying image. {}", elapsed);
                    publish_progress(ctx, &elapsed).await;
                }
                steps = steps.wrapping_add(1);
            }
            Ok(StepStatus::Done) => break,
            Err(e) => {
                error!("❌ Update step failed: {}", e);
                retries += 1;
                if retries > config.ota_max_retries {
                    error!("❌ Max retries reached, aborting update");
                    break;
                }
                info!("🔁 Retrying update step ({}/{})", retries, config.ota_max_retries);
            }
        }
        Timer::after(config.ota_step_delay()).await;
    }

    if !session.is_complete() {
        error!("❌ Complete image data was not received");
        return false;
    }

    if let Err(e) = session.finish() {
        error!("❌ Update failed to finish: {}", e);
        return false;
    }

    if let Err(e) = updater.commit_boot_target() {
        error!("❌ Failed to set boot target: {}", e);
        return false;
    }
    drop(updater);

    let duration = format_duration(started.elapsed());
    info!("✅ Image applied in {}, rebooting into new firmware", duration);
    publish_progress(ctx, &format!("OTA COMPLETED. Duration: {}", duration)).await;

    info!("🛑 Stopping broker client");
    if let Err(e) = ctx.broker.lock().await.stop() {
        warn!("⚠️ Failed to stop broker client: {}", e);
    }
    ctx.system.restart();
    true
}

/// Long-lived update runner; executes one accepted request at a time
pub async fn run_update_task<B, U, S>(ctx: &SupervisorContext<B, U, S>) -> !
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    info!("📥 Update task ready");
    loop {
        let locator = ctx.ota.slot.next_request().await;
        info!("📥 Starting update from {}", locator);

        match ctx.ota.slot.run(perform_update(ctx, &locator)).await {
            TaskState::Completed => info!("✅ Update completed"),
            TaskState::Failed => {
                error!("❌ Update failed, boot target unchanged");
                ctx.indicator.request_resync();
                if let Err(e) = publish_with_retries(
                    &ctx.broker,
                    &ctx.config.topics.status_request,
                    STATUS_REQUEST_PAYLOAD,
                    QoS::AtMostOnce,
                    ctx.config.publish_retries,
                )
                .await
                {
                    warn!("⚠️ Failed to request status after update failure: {}", e);
                }
            }
            TaskState::Idle | TaskState::Running => {
                info!("🛑 Update cancelled");
                ctx.indicator.request_resync();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::indicator::{Color, IndicatorEngine, IndicatorState};
    use crate::testing::{test_context, MockPwm, TestContext, TEST_DEVICE_ID};
    use embassy_futures::select::select;
    use embassy_sync::signal::Signal;

    const LOCATOR: &str = "https://example/fw.bin";

    fn request_for(id: &str) -> Vec<u8> {
        format!(r#"{{"{}":"{}"}}"#, id, LOCATOR).into_bytes()
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            ota_step_delay_ms: 1,
            ota_progress_interval: 2,
            ..Default::default()
        }
    }

    /// Run the update task until `until` resolves
    fn drive<F: core::future::Future<Output = ()>>(ctx: &TestContext, until: F) {
        embassy_futures::block_on(async {
            let _ = select(run_update_task(ctx), until).await;
        });
    }

    #[test]
    fn accepted_request_pins_indicator_and_marks_running() {
        let ctx = test_context(SupervisorConfig::default());
        ctx.indicator.apply(IndicatorState::Solid(Color::Green));

        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        assert_eq!(ctx.ota.state(), TaskState::Running);
        assert_eq!(ctx.indicator.current(), IndicatorState::UPDATE_IN_PROGRESS);
        assert!(ctx.indicator.is_sticky());
    }

    #[test]
    fn duplicate_request_is_rejected_without_side_effects() {
        let ctx = test_context(SupervisorConfig::default());
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();
        ctx.indicator.request_resync();

        assert_eq!(
            ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator),
            Err(SupervisorError::AlreadyInProgress)
        );
        // resync armed before the duplicate is still armed
        assert!(ctx.indicator.apply(IndicatorState::Solid(Color::Blue)));
    }

    #[test]
    fn requests_for_other_devices_are_not_targeted() {
        let ctx = test_context(SupervisorConfig::default());
        assert_eq!(
            ctx.ota.request_update(&request_for("00:00:00:00:00:01"), &ctx.indicator),
            Err(SupervisorError::NotTargeted)
        );
        assert!(matches!(
            ctx.ota.request_update(br#"{"24:6f:28:ab:01:fe":42}"#, &ctx.indicator),
            Err(SupervisorError::MalformedMessage(_))
        ));
        assert_eq!(ctx.ota.state(), TaskState::Idle);
        assert_eq!(ctx.indicator.current(), IndicatorState::BOOTING);
    }

    #[test]
    fn successful_update_commits_reports_and_restarts() {
        let ctx = test_context(fast_config());
        embassy_futures::block_on(ctx.ota.updater().lock()).in_progress_steps = 5;
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        drive(&ctx, async {
            while ctx.system.restarts() == 0 {
                Timer::after(Duration::from_millis(1)).await;
            }
        });

        let updater = embassy_futures::block_on(ctx.ota.updater().lock());
        assert_eq!(updater.begins, vec![LOCATOR.to_string()]);
        assert_eq!(updater.finishes, 1);
        assert_eq!(updater.commits, 1);
        assert_eq!(updater.aborts, 0);
        assert_eq!(updater.last_trust_anchor.as_deref(), Some("test-root-ca"));
        drop(updater);

        let broker = embassy_futures::block_on(ctx.broker.lock());
        let progress: Vec<&Vec<u8>> = broker
            .published
            .iter()
            .filter(|(topic, _, _)| topic == "coop/ota/progress")
            .map(|(_, payload, _)| payload)
            .collect();
        // steps 0, 2 and 4 report, then the completion message
        assert_eq!(progress.len(), 4);
        let last = String::from_utf8(progress[3].clone()).unwrap();
        assert!(last.contains("OTA COMPLETED. Duration: 00:00:00"), "{}", last);
        assert_eq!(broker.stops, 1);
        assert_eq!(ctx.ota.state(), TaskState::Completed);
    }

    #[test]
    fn exhausted_retries_fail_without_reboot_and_request_status() {
        let ctx = test_context(fast_config());
        embassy_futures::block_on(ctx.ota.updater().lock()).fail_steps = u32::MAX;
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        drive(&ctx, async {
            while ctx.ota.is_running() {
                Timer::after(Duration::from_millis(1)).await;
            }
            // let the runner finish its failure handling
            Timer::after(Duration::from_millis(5)).await;
        });

        let updater = embassy_futures::block_on(ctx.ota.updater().lock());
        // initial attempt plus five retries
        assert_eq!(updater.step_calls, 6);
        assert_eq!(updater.aborts, 1);
        assert_eq!(updater.commits, 0);
        drop(updater);

        assert_eq!(ctx.ota.state(), TaskState::Failed);
        assert_eq!(ctx.system.restarts(), 0);
        let broker = embassy_futures::block_on(ctx.broker.lock());
        assert!(broker
            .published
            .iter()
            .any(|(topic, payload, _)| topic == "coop/status/request" && payload == STATUS_REQUEST_PAYLOAD));
        drop(broker);

        // next status message restores the real state
        assert!(ctx.indicator.apply(IndicatorState::Solid(Color::Red)));
        assert!(!ctx.indicator.is_sticky());
    }

    #[test]
    fn incomplete_data_fails_the_update() {
        let ctx = test_context(fast_config());
        embassy_futures::block_on(ctx.ota.updater().lock()).report_incomplete = true;
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        drive(&ctx, async {
            while ctx.ota.is_running() {
                Timer::after(Duration::from_millis(1)).await;
            }
        });

        let updater = embassy_futures::block_on(ctx.ota.updater().lock());
        assert_eq!(updater.finishes, 0);
        assert_eq!(updater.aborts, 1);
        assert_eq!(ctx.ota.state(), TaskState::Failed);
    }

    #[test]
    fn cancel_releases_session_before_slot_is_free() {
        let ctx = test_context(fast_config());
        embassy_futures::block_on(ctx.ota.updater().lock()).in_progress_steps = u32::MAX;
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        drive(&ctx, async {
            Timer::after(Duration::from_millis(20)).await;
            assert!(ctx.ota.cancel_and_join().await);
            assert_eq!(ctx.ota.state(), TaskState::Idle);

            // session released before join returned, so the updater is free again
            let updater = ctx.ota.updater().lock().await;
            assert_eq!(updater.aborts, 1);
            assert_eq!(updater.begins.len(), 1);
        });

        assert!(ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).is_ok());
        assert_eq!(ctx.system.restarts(), 0);
    }

    #[test]
    fn blocking_update_steps_do_not_stall_indicator_rendering() {
        let ctx = test_context(fast_config());
        {
            let mut updater = embassy_futures::block_on(ctx.ota.updater().lock());
            updater.in_progress_steps = u32::MAX;
            updater.step_sleep = Some(std::time::Duration::from_millis(200));
        }
        ctx.ota.request_update(&request_for(TEST_DEVICE_ID), &ctx.indicator).unwrap();

        let stop: Signal<CriticalSectionRawMutex, ()> = Signal::new();
        let mut engine = IndicatorEngine::new(MockPwm::new(8191), &ctx.config);

        // the update runner gets its own thread, rendering stays on this one
        std::thread::scope(|scope| {
            scope.spawn(|| drive(&ctx, stop.wait()));
            embassy_futures::block_on(async {
                let _ = select(engine.run(&ctx.indicator), Timer::after(Duration::from_millis(1000))).await;
            });
            stop.signal(());
        });

        // 25 ms period over one second
        let frames = engine.outputs().frames.len();
        assert!(frames >= 25, "only {} frames rendered", frames);

        let updater = embassy_futures::block_on(ctx.ota.updater().lock());
        assert!(updater.step_calls >= 2);
        assert_eq!(updater.aborts, 1);
    }

    #[test]
    fn progress_and_completion_text() {
        assert_eq!(format_elapsed(Duration::from_secs(125)), "02:05 elapsed...");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(
            hostname_message("coop-monitor", "OTA BOOTED"),
            br#"{"coop-monitor":"OTA BOOTED"}"#.to_vec()
        );
    }
}
