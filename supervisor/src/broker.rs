// Broker Client Interface
// Typed events delivered by the broker client plus the narrow capability set the supervisor consumes
// The concrete client (TLS MQTT on device, test double on host) lives outside this crate

use anyhow::Result;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use log::{debug, warn};

pub const BROKER_EVENT_QUEUE_SIZE: usize = 16;

/// Queue the broker client pushes events into; the router is its only consumer
pub type BrokerEventChannel = Channel<CriticalSectionRawMutex, BrokerEvent, BROKER_EVENT_QUEUE_SIZE>;

/// Broker client shared between the router (subscribe / reconnect / stop) and the OTA task (publish)
pub type SharedBroker<B> = Mutex<CriticalSectionRawMutex, B>;

/// Delivery guarantee for a publish / subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Broker error categories, kept only for logging before recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerErrorKind {
    SecureTransport {
        last_esp_error: i32,
        tls_stack_error: i32,
        cert_verify_flags: i32,
    },
    ConnectionRefused {
        return_code: i32,
    },
    Unknown {
        error_type: i32,
    },
}

impl core::fmt::Display for BrokerErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BrokerErrorKind::SecureTransport {
                last_esp_error,
                tls_stack_error,
                cert_verify_flags,
            } => write!(
                f,
                "secure transport failure (esp error 0x{:x}, tls stack error 0x{:x}, cert verify flags 0x{:x})",
                last_esp_error, tls_stack_error, cert_verify_flags
            ),
            BrokerErrorKind::ConnectionRefused { return_code } => {
                write!(f, "connection refused (return code 0x{:x})", return_code)
            }
            BrokerErrorKind::Unknown { error_type } => {
                write!(f, "unknown error type 0x{:x}", error_type)
            }
        }
    }
}

/// Notifications produced by the broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Data { topic: String, payload: Vec<u8> },
    Error(BrokerErrorKind),
}

/// Capabilities the supervisor needs from the broker client.
/// Connecting with the deployment configuration happens when the client is constructed.
pub trait BrokerClient {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()>;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<()>;
    fn reconnect(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Publish with a bounded number of immediate retries (transient failures only)
pub async fn publish_with_retries<B: BrokerClient>(
    broker: &SharedBroker<B>,
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retries: u32,
) -> Result<()> {
    let mut client = broker.lock().await;
    let mut attempt = 0;
    loop {
        match client.publish(topic, payload, qos) {
            Ok(()) => {
                debug!("📤 Published {} bytes to {}", payload.len(), topic);
                return Ok(());
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("⚠️ Publish to {} failed ({}), retry {}/{}", topic, e, attempt, retries);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;

    #[test]
    fn publish_retries_are_bounded() {
        let broker = SharedBroker::new(MockBroker::default());
        embassy_futures::block_on(async {
            broker.lock().await.fail_publishes = 2;
            publish_with_retries(&broker, "coop/status/request", b"{}", QoS::AtMostOnce, 3)
                .await
                .unwrap();

            broker.lock().await.fail_publishes = 10;
            let result =
                publish_with_retries(&broker, "coop/status/request", b"{}", QoS::AtMostOnce, 3).await;
            assert!(result.is_err());
        });

        let client = embassy_futures::block_on(broker.lock());
        // one success after two failures, then four failed attempts
        assert_eq!(client.publish_attempts, 3 + 4);
        assert_eq!(client.published.len(), 1);
    }

    #[test]
    fn error_kinds_render_for_logging() {
        let kind = BrokerErrorKind::ConnectionRefused { return_code: 5 };
        assert_eq!(kind.to_string(), "connection refused (return code 0x5)");
    }
}
