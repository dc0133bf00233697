use anyhow::Result;
use embassy_time::{Duration, Instant, Timer};
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use log::{info, warn};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Start SNTP and wait (bounded) for the first sync. TLS certificate validity checks need a
/// wall clock, so an unsynced clock is logged loudly but the boot continues.
pub async fn sync_time() -> Result<EspSntp<'static>> {
    info!("🕒 Starting SNTP time sync");
    let sntp = EspSntp::new_default()?;

    let started = Instant::now();
    while sntp.get_sync_status() != SyncStatus::Completed {
        if started.elapsed() > SYNC_TIMEOUT {
            warn!("⚠️ SNTP sync not completed after {}s", SYNC_TIMEOUT.as_secs());
            return Ok(sntp);
        }
        Timer::after(Duration::from_millis(500)).await;
    }

    info!("✅ Time synchronized: {}", chrono::Utc::now().to_rfc3339());
    Ok(sntp)
}
