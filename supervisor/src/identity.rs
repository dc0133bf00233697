use serde_json::{Map, Value};

use crate::error::SupervisorError;

/// Hardware-burned device identity (station MAC), fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Identity in the `aa:bb:cc:dd:ee:ff` form the broker side keys its messages on
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        ))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Look this device up in a `{"<identity>": <value>, ...}` message.
    /// Fails with `NotTargeted` when the message has no entry for this device.
    pub fn lookup<'a>(&self, message: &'a Map<String, Value>) -> Result<&'a Value, SupervisorError> {
        message.get(&self.0).ok_or(SupervisorError::NotTargeted)
    }
}

impl core::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a payload that must be a JSON object keyed by device identity
pub fn parse_keyed_message(payload: &[u8]) -> Result<Map<String, Value>, SupervisorError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SupervisorError::malformed("payload is not a JSON object")),
        Err(e) => Err(SupervisorError::malformed(format!("invalid JSON: {}", e))),
    }
}
