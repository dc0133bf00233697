// Connectivity Event Router
// Sequential dispatch of broker events: subscriptions, reconnection policy, watchdog resets
// and hand-off of status / update / self-test messages

use embassy_time::Timer;
use log::{debug, error, info, warn};

use crate::broker::{publish_with_retries, BrokerClient, BrokerErrorKind, BrokerEvent, BrokerEventChannel, QoS};
use crate::config::InactiveTransportPolicy;
use crate::context::SupervisorContext;
use crate::error::SupervisorError;
use crate::identity::parse_keyed_message;
use crate::indicator::parse_status_payload;
use crate::ota::{hostname_message, SecureUpdater, STATUS_REQUEST_PAYLOAD};
use crate::self_test::run_self_test;
use crate::system::{fatal_recovery, SystemControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting(u32),
}

pub struct Router<'a, B: BrokerClient, U: SecureUpdater, S: SystemControl> {
    ctx: &'a SupervisorContext<B, U, S>,
    state: ConnectionState,
}

impl<'a, B, U, S> Router<'a, B, U, S>
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    pub fn new(ctx: &'a SupervisorContext<B, U, S>) -> Self {
        Self {
            ctx,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub async fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => self.on_connected().await,
            BrokerEvent::Disconnected => self.on_disconnected().await,
            BrokerEvent::Data { topic, payload } => self.on_data(&topic, &payload).await,
            BrokerEvent::Error(kind) => self.on_error(kind).await,
        }
    }

    async fn on_connected(&mut self) {
        info!("🔗 Broker connected");
        self.state = ConnectionState::Connected;
        let ctx = self.ctx;

        {
            let mut broker = ctx.broker.lock().await;
            for topic in ctx.config.topics.subscriptions() {
                match broker.subscribe(topic, QoS::AtMostOnce) {
                    Ok(()) => info!("📬 Subscribed to {}", topic),
                    Err(e) => warn!("⚠️ Failed to subscribe to {}: {}", topic, e),
                }
            }
        }

        // the reply to this request may replace a sticky update indicator
        ctx.indicator.request_resync();
        match self.publish(&ctx.config.topics.status_request, STATUS_REQUEST_PAYLOAD, QoS::AtMostOnce).await {
            Ok(()) => info!("📤 Published initial status request"),
            Err(e) => warn!("⚠️ Failed to publish status request: {}", e),
        }

        if ctx.take_post_update_boot() {
            info!("🆕 First boot after update, announcing");
            let payload = hostname_message(&ctx.config.hostname, "OTA BOOTED");
            if let Err(e) = self.publish(&ctx.config.topics.ota_progress, &payload, QoS::AtLeastOnce).await {
                warn!("⚠️ Failed to announce update boot: {}", e);
            }
        }
    }

    async fn on_disconnected(&mut self) {
        warn!("🔌 Broker disconnected");
        let ctx = self.ctx;

        if ctx.ota.cancel_and_join().await {
            warn!("🛑 Running update cancelled on disconnect");
        }

        let max_attempts = ctx.config.reconnect_max_attempts;
        let mut attempt = match self.state {
            ConnectionState::Reconnecting(attempt) => attempt,
            _ => 0,
        };

        while attempt < max_attempts {
            if !ctx.system.network_active() {
                match ctx.config.inactive_transport_policy {
                    InactiveTransportPolicy::Reboot => {
                        self.state = ConnectionState::Disconnected;
                        fatal_recovery(&ctx.broker, &ctx.system, "network transport inactive").await;
                        return;
                    }
                    InactiveTransportPolicy::Retry => {
                        attempt += 1;
                        self.state = ConnectionState::Reconnecting(attempt);
                        warn!("📶 Network inactive, waiting ({}/{})", attempt, max_attempts);
                        if attempt < max_attempts {
                            Timer::after(ctx.config.reconnect_delay()).await;
                        }
                        continue;
                    }
                }
            }

            attempt += 1;
            self.state = ConnectionState::Reconnecting(attempt);
            info!("🔄 Reconnect attempt {}/{}", attempt, max_attempts);

            let result = ctx.broker.lock().await.reconnect();
            match result {
                Ok(()) => {
                    info!("🔄 Reconnect initiated, waiting for broker");
                    return;
                }
                Err(e) => warn!("⚠️ Reconnect attempt {} failed: {}", attempt, e),
            }

            if attempt < max_attempts {
                Timer::after(ctx.config.reconnect_delay()).await;
            }
        }

        self.state = ConnectionState::Disconnected;
        fatal_recovery(&ctx.broker, &ctx.system, "reconnect attempts exhausted").await;
    }

    async fn on_data(&mut self, topic: &str, payload: &[u8]) {
        let ctx = self.ctx;

        if let Err(e) = ctx.watchdog.reset() {
            fatal_recovery(&ctx.broker, &ctx.system, &e.to_string()).await;
            return;
        }

        let topics = &ctx.config.topics;
        if topic == topics.status {
            self.on_status(payload);
        } else if topic == topics.update_request {
            match ctx.ota.request_update(payload, &ctx.indicator) {
                Ok(()) => {}
                Err(SupervisorError::NotTargeted) => debug!("Update request not addressed to this device"),
                Err(SupervisorError::AlreadyInProgress) => {
                    warn!("⏳ Update already running, skipping request")
                }
                Err(e) => warn!("⚠️ Update request dropped: {}", e),
            }
        } else if topic == topics.self_test_request {
            self.on_self_test(payload).await;
        } else {
            debug!("Message on unhandled topic {}", topic);
        }
    }

    fn on_status(&self, payload: &[u8]) {
        let state = match parse_status_payload(payload) {
            Ok(state) => state,
            Err(e) => {
                warn!("⚠️ Status message dropped: {}", e);
                return;
            }
        };

        self.ctx.indicator.apply(state);
        if state.is_alert() {
            info!("🚨 Alert state {}", state);
            self.ctx.audio.trigger_alert();
        }
    }

    async fn on_self_test(&self, payload: &[u8]) {
        let ctx = self.ctx;
        let targeted = parse_keyed_message(payload).and_then(|message| ctx.identity.lookup(&message).map(|_| ()));
        match targeted {
            Ok(()) => {}
            Err(SupervisorError::NotTargeted) => {
                debug!("Self-test not addressed to {}", ctx.identity);
                return;
            }
            Err(e) => {
                warn!("⚠️ Self-test request dropped: {}", e);
                return;
            }
        }

        if ctx.ota.is_running() {
            warn!("🧪 Self-test ignored while an update is running");
            return;
        }
        run_self_test(ctx).await;
    }

    async fn on_error(&mut self, kind: BrokerErrorKind) {
        match &kind {
            BrokerErrorKind::SecureTransport { .. } => error!("🔒 Broker secure transport error: {}", kind),
            BrokerErrorKind::ConnectionRefused { .. } => error!("🚫 Broker refused connection: {}", kind),
            BrokerErrorKind::Unknown { .. } => error!("❓ Broker error: {}", kind),
        }
        self.state = ConnectionState::Disconnected;
        fatal_recovery(&self.ctx.broker, &self.ctx.system, "broker error").await;
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> anyhow::Result<()> {
        publish_with_retries(&self.ctx.broker, topic, payload, qos, self.ctx.config.publish_retries).await
    }
}

/// Consume broker events one at a time; each is fully handled before the next is received
pub async fn run_router<B, U, S>(ctx: &SupervisorContext<B, U, S>, events: &BrokerEventChannel) -> !
where
    B: BrokerClient,
    U: SecureUpdater,
    S: SystemControl,
{
    info!("🧭 Event router started");
    let mut router = Router::new(ctx);
    loop {
        let event = events.receive().await;
        router.handle_event(event).await;
    }
}
