// MQTT Broker Client
// Mutually authenticated TLS MQTT connection. Connection events are read on a dedicated thread
// and forwarded into the supervisor's broker event queue; the supervisor drives subscribe,
// publish, reconnect and stop through the BrokerClient implementation below.

use std::time::Duration;

use anyhow::{anyhow, Result};
use esp_idf_svc::handle::RawHandle;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration, QoS as EspQoS,
};
use esp_idf_svc::sys::{self, EspError};
use esp_idf_svc::tls::X509;
use log::{debug, error, info, warn};

use coop_supervisor::{BrokerClient, BrokerErrorKind, BrokerEvent, BrokerEventChannel, DeviceIdentity, QoS};

use crate::deployment_storage::DeploymentConfig;

/// Queue shared by the connection thread (producer) and the router task (consumer)
pub static BROKER_EVENTS: BrokerEventChannel = BrokerEventChannel::new();

// esp-tls reports its failures in 0x8000..0x80ff
const ESP_TLS_ERROR_BASE: i32 = 0x8000;
const ESP_TLS_ERROR_END: i32 = 0x8100;

const EVENT_THREAD_STACK_SIZE: usize = 8 * 1024;
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

pub struct MqttBroker {
    client: EspMqttClient<'static>,
    broker_uri: String,
}

impl MqttBroker {
    /// Open the TLS session and start forwarding connection events into `events`
    pub fn connect(
        deployment: &DeploymentConfig,
        identity: &DeviceIdentity,
        events: &'static BrokerEventChannel,
    ) -> Result<Self> {
        let client_id = format!("{}-{}", deployment.hostname, identity.as_str().replace(':', ""));
        info!(
            "🔌 Creating MQTT client for {} (client_id: {})",
            deployment.broker_uri, client_id
        );

        let client_certificate = convert_pem_to_x509(&deployment.client_certificate)?;
        let private_key = convert_pem_to_x509(&deployment.private_key)?;
        let trust_anchor = convert_pem_to_x509(&deployment.trust_anchor)?;

        let mqtt_config = MqttClientConfiguration {
            client_id: Some(&client_id),
            client_certificate: Some(client_certificate),
            private_key: Some(private_key),
            server_certificate: Some(trust_anchor),
            keep_alive_interval: Some(Duration::from_secs(60)),
            reconnect_timeout: Some(Duration::from_secs(30)),
            network_timeout: Duration::from_secs(30),
            use_global_ca_store: false,
            skip_cert_common_name_check: false,
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(&deployment.broker_uri, &mqtt_config)
            .map_err(|e| anyhow!("Failed to create MQTT client: {}", e))?;

        std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .stack_size(EVENT_THREAD_STACK_SIZE)
            .spawn(move || forward_events(connection, events))
            .map_err(|e| anyhow!("Failed to spawn MQTT event thread: {}", e))?;

        info!("✅ MQTT client created, waiting for broker session");

        Ok(Self {
            client,
            broker_uri: deployment.broker_uri.clone(),
        })
    }
}

impl BrokerClient for MqttBroker {
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()> {
        let id = self
            .client
            .subscribe(topic, map_qos(qos))
            .map_err(|e| anyhow!("Subscribe to {} failed: {}", topic, e))?;
        debug!("📥 Subscribe request {} sent for {}", id, topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<()> {
        let id = self
            .client
            .publish(topic, map_qos(qos), false, payload)
            .map_err(|e| anyhow!("Publish to {} failed: {}", topic, e))?;
        debug!("📤 Published message {} to {} ({} bytes)", id, topic, payload.len());
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        info!("🔄 Requesting reconnect to {}", self.broker_uri);
        let result = unsafe { sys::esp_mqtt_client_reconnect(self.client.handle()) };
        EspError::convert(result).map_err(|e| anyhow!("Reconnect request failed: {}", e))
    }

    fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping MQTT client");
        let result = unsafe { sys::esp_mqtt_client_stop(self.client.handle()) };
        EspError::convert(result).map_err(|e| anyhow!("Stopping MQTT client failed: {}", e))
    }
}

fn map_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
    }
}

/// Convert PEM certificate string to X509 format for ESP-IDF
/// Uses Box::leak() to create static lifetime CStr required by ESP-IDF
fn convert_pem_to_x509(pem_cert: &str) -> Result<X509<'static>> {
    use std::ffi::CString;

    let c_string =
        CString::new(pem_cert).map_err(|e| anyhow!("PEM certificate contains null bytes: {}", e))?;
    let static_cstr: &'static std::ffi::CStr = Box::leak(c_string.into_boxed_c_str());

    Ok(X509::pem(static_cstr))
}

fn classify_error(error: &EspError) -> BrokerErrorKind {
    let code = error.code();
    if (ESP_TLS_ERROR_BASE..ESP_TLS_ERROR_END).contains(&code) {
        // The client only surfaces the esp-tls code; the stack error and verify flags stay zero
        BrokerErrorKind::SecureTransport {
            last_esp_error: code,
            tls_stack_error: 0,
            cert_verify_flags: 0,
        }
    } else {
        BrokerErrorKind::Unknown { error_type: code }
    }
}

fn translate(payload: EventPayload<'_, EspError>) -> Option<BrokerEvent> {
    match payload {
        EventPayload::Connected(session_present) => {
            info!("🔗 Broker session established (session present: {})", session_present);
            Some(BrokerEvent::Connected)
        }
        EventPayload::Disconnected => {
            warn!("🔌 Broker session lost");
            Some(BrokerEvent::Disconnected)
        }
        EventPayload::Received {
            topic: Some(topic),
            data,
            details: Details::Complete,
            ..
        } => Some(BrokerEvent::Data {
            topic: topic.to_string(),
            payload: data.to_vec(),
        }),
        EventPayload::Received { topic, details, .. } => {
            warn!("⚠️ Ignoring fragmented or topic-less message ({:?}, {:?})", topic, details);
            None
        }
        EventPayload::Error(e) => {
            error!("❌ MQTT client error: {:?}", e);
            Some(BrokerEvent::Error(classify_error(e)))
        }
        other => {
            debug!("MQTT event: {:?}", other);
            None
        }
    }
}

fn forward_events(mut connection: EspMqttConnection, events: &'static BrokerEventChannel) {
    info!("📡 MQTT event thread started");

    while let Ok(event) = connection.next() {
        let Some(mut pending) = translate(event.payload()) else {
            continue;
        };

        // Events are never dropped; wait for the router to drain the queue
        loop {
            match events.try_send(pending) {
                Ok(()) => break,
                Err(embassy_sync::channel::TrySendError::Full(event)) => {
                    warn!("⚠️ Broker event queue full, waiting");
                    pending = event;
                    std::thread::sleep(QUEUE_FULL_BACKOFF);
                }
            }
        }
    }

    info!("📡 MQTT connection closed, event thread exiting");
}

