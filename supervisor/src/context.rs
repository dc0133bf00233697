// Supervisor Context
// Everything the router, update task and watchdog share, owned in one place and handed to
// each task by reference. Cross-task state is only reachable through guarded accessors.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::audio::AudioAlert;
use crate::broker::{BrokerClient, SharedBroker};
use crate::config::SupervisorConfig;
use crate::identity::DeviceIdentity;
use crate::indicator::{Indicator, IndicatorState};
use crate::ota::{OtaManager, SecureUpdater};
use crate::system::SystemControl;
use crate::watchdog::Watchdog;

pub struct SupervisorContext<B: BrokerClient, U: SecureUpdater, S: SystemControl> {
    pub config: SupervisorConfig,
    pub identity: DeviceIdentity,
    pub broker: SharedBroker<B>,
    pub indicator: Indicator,
    pub audio: AudioAlert,
    pub watchdog: Watchdog,
    pub ota: OtaManager<U>,
    pub system: S,
    post_update_boot: AtomicBool,
}

impl<B: BrokerClient, U: SecureUpdater, S: SystemControl> SupervisorContext<B, U, S> {
    pub fn new(
        config: SupervisorConfig,
        identity: DeviceIdentity,
        broker: B,
        updater: U,
        trust_anchor: impl Into<String>,
        system: S,
    ) -> Self {
        Self {
            watchdog: Watchdog::new(config.watchdog_timeout()),
            ota: OtaManager::new(identity.clone(), trust_anchor, updater),
            broker: SharedBroker::new(broker),
            indicator: Indicator::new(IndicatorState::BOOTING),
            audio: AudioAlert::new(),
            post_update_boot: AtomicBool::new(false),
            config,
            identity,
            system,
        }
    }

    /// Remember that this boot is the first one after an applied update
    pub fn mark_post_update_boot(&self) {
        self.post_update_boot.store(true, Ordering::Release);
    }

    /// True exactly once after `mark_post_update_boot`
    pub fn take_post_update_boot(&self) -> bool {
        self.post_update_boot.swap(false, Ordering::AcqRel)
    }
}
