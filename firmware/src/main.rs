// Coop Monitor Firmware
// Brings up the collaborators (Wi-Fi, time, NVS, TLS MQTT, HTTPS OTA, LEDC, I2S) and hands
// them to the device supervisor. Router, watchdog and indicator share the main executor;
// the update and audio tasks run on executors of their own threads.

mod audio_output;
mod deployment_storage;
mod device_info;
mod led_output;
mod mqtt_client;
mod nvs_store;
mod ota_transport;
mod system;
mod time_sync;
mod wifi_client;

use anyhow::{anyhow, Result};
use embassy_executor::{Executor, Spawner};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::gpio::OutputPin;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{error, info, warn};

use coop_supervisor::{
    detect_post_update_boot, run_router, run_update_task, run_watchdog, AudioAlert, AudioChannel,
    BrokerEventChannel, Indicator, IndicatorEngine, SupervisorContext,
};

use audio_output::AudioOutput;
use deployment_storage::DeploymentStorage;
use led_output::LedOutputs;
use mqtt_client::{MqttBroker, BROKER_EVENTS};
use nvs_store::NvsStore;
use ota_transport::HttpsUpdater;
use system::EspSystem;
use wifi_client::WiFiClient;

type Supervisor = SupervisorContext<MqttBroker, HttpsUpdater, EspSystem>;

// TLS handshakes need the larger stack; the main task runs at priority 1, so the update
// thread time-slices with rendering instead of preempting it
const UPDATE_THREAD_STACK_SIZE: usize = 16 * 1024;
const UPDATE_THREAD_PRIORITY: u8 = 1;
const AUDIO_THREAD_STACK_SIZE: usize = 8 * 1024;
const AUDIO_THREAD_PRIORITY: u8 = 5;

#[embassy_executor::task]
async fn router_task(ctx: &'static Supervisor, events: &'static BrokerEventChannel) {
    run_router(ctx, events).await
}

#[embassy_executor::task]
async fn update_task(ctx: &'static Supervisor) {
    run_update_task(ctx).await
}

#[embassy_executor::task]
async fn watchdog_task(ctx: &'static Supervisor) {
    run_watchdog(ctx).await
}

#[embassy_executor::task]
async fn indicator_task(mut engine: IndicatorEngine<LedOutputs>, indicator: &'static Indicator) {
    engine.run(indicator).await
}

#[embassy_executor::task]
async fn audio_task(mut channel: AudioChannel<AudioOutput>, alert: &'static AudioAlert) {
    channel.run(alert).await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("🐔 Coop monitor starting (partition {})", device_info::running_partition_label());

    if let Err(e) = start(spawner).await {
        error!("❌ Startup failed: {:?}", e);
        error!("🔄 Restarting to retry bring-up");
        unsafe {
            esp_idf_svc::sys::esp_restart();
        }
    }
}

async fn start(spawner: Spawner) -> Result<()> {
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let deployment = DeploymentStorage::new(nvs_partition.clone())?.load()?;

    let mut wifi = WiFiClient::new(peripherals.modem, sys_loop, nvs_partition.clone())?;
    wifi.connect(&deployment.wifi_ssid, &deployment.wifi_password, &deployment.hostname)
        .await?;

    // The SNTP service must outlive startup
    let sntp = time_sync::sync_time().await?;
    Box::leak(Box::new(sntp));

    let identity = device_info::device_identity();
    info!("🆔 Device identity: {}", identity);

    let post_update_boot = match device_info::boot_partition_address() {
        Some(address) => {
            let mut store = NvsStore::new(nvs_partition.clone())?;
            detect_post_update_boot(&mut store, address, device_info::was_software_reset())?
        }
        None => {
            warn!("⚠️ Boot partition unknown, skipping update detection");
            false
        }
    };

    let broker = MqttBroker::connect(&deployment, &identity, &BROKER_EVENTS)?;
    let ctx: &'static Supervisor = Box::leak(Box::new(SupervisorContext::new(
        deployment.supervisor.clone(),
        identity,
        broker,
        HttpsUpdater::new(),
        deployment.trust_anchor.clone(),
        EspSystem::new(wifi),
    )));
    if post_update_boot {
        info!("🆕 First boot after firmware update");
        ctx.mark_post_update_boot();
    }

    let pins = peripherals.pins;
    let leds = LedOutputs::new(
        peripherals.ledc.timer0,
        peripherals.ledc.channel0,
        pins.gpio1,
        peripherals.ledc.channel1,
        pins.gpio2,
        peripherals.ledc.channel2,
        pins.gpio3,
    )?;
    let engine = IndicatorEngine::new(leds, &ctx.config);

    audio_output::mount_storage()?;
    let speaker = AudioOutput::new(
        peripherals.i2s0,
        pins.gpio6,
        pins.gpio7,
        pins.gpio5,
        pins.gpio9.downgrade_output(),
        pins.gpio10.downgrade_output(),
        audio_output::ALERT_CLIP_PATH,
    )?;
    let channel = AudioChannel::new(speaker, &ctx.config);

    spawner
        .spawn(indicator_task(engine, &ctx.indicator))
        .map_err(|e| anyhow!("Failed to spawn indicator task: {:?}", e))?;
    spawner
        .spawn(watchdog_task(ctx))
        .map_err(|e| anyhow!("Failed to spawn watchdog task: {:?}", e))?;

    // HTTPS reads, SPIFFS reads and I2S writes block their thread, so these tasks
    // get their own executors
    spawn_executor_thread(b"audio\0", AUDIO_THREAD_STACK_SIZE, AUDIO_THREAD_PRIORITY, move |spawner| {
        if let Err(e) = spawner.spawn(audio_task(channel, &ctx.audio)) {
            error!("❌ Failed to spawn audio task: {:?}", e);
        }
    })?;
    spawn_executor_thread(b"ota-update\0", UPDATE_THREAD_STACK_SIZE, UPDATE_THREAD_PRIORITY, move |spawner| {
        if let Err(e) = spawner.spawn(update_task(ctx)) {
            error!("❌ Failed to spawn update task: {:?}", e);
        }
    })?;

    spawner
        .spawn(router_task(ctx, &BROKER_EVENTS))
        .map_err(|e| anyhow!("Failed to spawn router task: {:?}", e))?;

    info!("✅ All supervisor tasks spawned");
    Ok(())
}

/// Start a FreeRTOS thread running its own embassy executor, seeded by `init`
fn spawn_executor_thread<F>(name: &'static [u8], stack_size: usize, priority: u8, init: F) -> Result<()>
where
    F: FnOnce(Spawner) + Send + 'static,
{
    ThreadSpawnConfiguration {
        name: Some(name),
        stack_size,
        priority,
        ..Default::default()
    }
    .set()?;

    let spawned = std::thread::Builder::new().stack_size(stack_size).spawn(move || {
        let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
        executor.run(init)
    });

    // threads spawned later go back to the pthread defaults
    ThreadSpawnConfiguration::default().set()?;

    let label = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned();
    spawned.map_err(|e| anyhow!("Failed to spawn {} thread: {}", label, e))?;
    info!("🧵 {} thread started (priority {})", label, priority);
    Ok(())
}
