// Liveness Watchdog
// Single-shot orphan timer, rearmed on every inbound broker message

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::config::WatchdogPolicy;
use crate::context::SupervisorContext;
use crate::error::SupervisorError;
use crate::indicator::IndicatorState;
use crate::ota::SecureUpdater;
use crate::system::{fatal_recovery, SystemControl};

pub struct Watchdog {
    timeout: Duration,
    running: AtomicBool,
    rearm: Signal<CriticalSectionRawMutex, Instant>,
    resets: AtomicU32,
    expirations: AtomicU32,
}

impl Watchdog {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            running: AtomicBool::new(false),
            rearm: Signal::new(),
            resets: AtomicU32::new(0),
            expirations: AtomicU32::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark the timer service available and arm the first deadline (silence since boot counts)
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        self.rearm.signal(Instant::now() + self.timeout);
        info!("⏱️ Watchdog armed ({} s)", self.timeout.as_secs());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Push the deadline to now + timeout. Fails as fatal when the timer service is not running.
    pub fn reset(&self) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::Fatal("watchdog timer is not running".into()));
        }
        self.rearm.signal(Instant::now() + self.timeout);
        self.resets.fetch_add(1, Ordering::Relaxed);
        debug!("⏱️ Watchdog reset");
        Ok(())
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn expiration_count(&self) -> u32 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Resolve once the armed deadline passes with no reset in between.
    /// After an expiry the timer stays disarmed until the next `reset`.
    pub async fn expired(&self) {
        let mut deadline = self.rearm.wait().await;
        loop {
            match select(Timer::at(deadline), self.rearm.wait()).await {
                Either::First(()) => {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Either::Second(next) => deadline = next,
            }
        }
    }
}

/// Apply the configured recovery action after prolonged broker silence
pub async fn apply_watchdog_recovery<B, U, S>(ctx: &SupervisorContext<B, U, S>)
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    match ctx.config.watchdog_policy {
        WatchdogPolicy::AlertOrphaned => {
            warn!("🚨 Device orphaned: showing {}", IndicatorState::ORPHANED);
            if !ctx.indicator.apply(IndicatorState::ORPHANED) {
                info!("📌 Update indicator kept, sounding alert only");
            }
            ctx.audio.trigger_alert();
        }
        WatchdogPolicy::Reboot => {
            fatal_recovery(&ctx.broker, &ctx.system, "no broker traffic before watchdog deadline").await;
        }
    }
}

pub async fn run_watchdog<B, U, S>(ctx: &SupervisorContext<B, U, S>) -> !
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    ctx.watchdog.start();
    loop {
        ctx.watchdog.expired().await;
        error!(
            "⏰ No broker message for {} s, watchdog fired",
            ctx.watchdog.timeout().as_secs()
        );
        apply_watchdog_recovery(ctx).await;
    }
}
