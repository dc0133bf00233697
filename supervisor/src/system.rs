// System Control
// Network transport status, Wi-Fi release and device restart, plus the single fatal recovery path

use log::{error, info, warn};

use crate::broker::{BrokerClient, SharedBroker};

/// Device-level capabilities shared by the router, the OTA task and the watchdog
pub trait SystemControl {
    /// Whether the underlying network transport (Wi-Fi station) is still up
    fn network_active(&self) -> bool;
    /// Stop and deinitialise the wireless connection
    fn release_network(&self);
    /// Restart the device. Does not return on hardware.
    fn restart(&self);
}

/// Return the device to a known-good state: stop the broker client, release Wi-Fi, restart.
/// Used for every fatal path so the device never hangs silently.
pub async fn fatal_recovery<B: BrokerClient, S: SystemControl>(
    broker: &SharedBroker<B>,
    system: &S,
    reason: &str,
) {
    error!("💥 Fatal: {} - restarting device", reason);

    match broker.lock().await.stop() {
        Ok(()) => info!("✅ Broker client stopped"),
        Err(e) => warn!("⚠️ Failed to stop broker client: {}", e),
    }

    system.release_network();
    info!("📴 Wireless connection released");

    system.restart();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, MockSystem};

    #[test]
    fn fatal_recovery_stops_broker_releases_network_then_restarts() {
        let broker = SharedBroker::new(MockBroker::default());
        let system = MockSystem::default();

        embassy_futures::block_on(fatal_recovery(&broker, &system, "test"));

        assert_eq!(embassy_futures::block_on(broker.lock()).stops, 1);
        assert_eq!(system.calls(), vec!["release_network", "restart"]);
    }

    #[test]
    fn restart_happens_even_if_broker_stop_fails() {
        let broker = SharedBroker::new(MockBroker {
            fail_stop: true,
            ..Default::default()
        });
        let system = MockSystem::default();

        embassy_futures::block_on(fatal_recovery(&broker, &system, "test"));

        assert_eq!(system.restarts(), 1);
    }
}
