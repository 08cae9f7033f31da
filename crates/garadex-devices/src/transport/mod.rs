//! Transport adapters for moving commands and status requests.
//!
//! Two interchangeable delivery mechanisms exist: a push-capable cloud
//! channel over MQTT and a direct local channel over HTTP. Both speak the
//! same signed message envelope and reduce status responses to the single
//! sensor boolean the reconciliation engine consumes. Which one a device
//! uses is decided once, at controller construction.

pub mod cloud;
pub mod local;

pub use cloud::{CloudTransport, CloudTransportConfig, PushNotification};
pub use local::{LocalTransport, LocalTransportConfig};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DeviceError;

/// Message namespaces understood by the device firmware.
pub mod namespaces {
    /// Full system digest, polled periodically.
    pub const SYSTEM_ALL: &str = "Appliance.System.All";
    /// Garage door control and push notifications.
    pub const GARAGE_DOOR_STATE: &str = "Appliance.GarageDoor.State";
}

/// Which channel a transport delivers over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// MQTT through the vendor cloud; the device echoes its own commands
    /// back as push notifications.
    Cloud,
    /// Direct HTTP to the device on the local network.
    Local,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Delivery mechanism for device commands and status requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which channel this transport delivers over.
    fn kind(&self) -> TransportKind;

    /// Send a door control command. `open == true` drives the door open.
    async fn send_control(&self, open: bool) -> Result<(), DeviceError>;

    /// Request the full status digest from the device.
    async fn request_status(&self) -> Result<StatusPayload, DeviceError>;
}

/// Signed message header shared by both transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub method: String,
    pub namespace: String,
    pub timestamp: i64,
    pub sign: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl MessageHeader {
    /// Build a header signed with the device key.
    ///
    /// The signature is `md5(message_id + key + timestamp)` in lowercase
    /// hex, which is what the firmware verifies.
    pub fn new(method: &str, namespace: &str, key: &str, from: Option<String>) -> Self {
        let message_id = format!("{:x}", md5::compute(uuid::Uuid::new_v4().as_bytes()));
        let timestamp = chrono::Utc::now().timestamp();
        let sign = format!(
            "{:x}",
            md5::compute(format!("{message_id}{key}{timestamp}"))
        );
        Self {
            message_id,
            method: method.to_string(),
            namespace: namespace.to_string(),
            timestamp,
            sign,
            from,
        }
    }
}

/// Message envelope: header plus a namespace-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Explicit error reported by the device inside a response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFault {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.detail) {
            (Some(code), Some(detail)) => write!(f, "code {code}: {detail}"),
            (Some(code), None) => write!(f, "code {code}"),
            (None, Some(detail)) => write!(f, "{detail}"),
            (None, None) => write!(f, "unspecified device error"),
        }
    }
}

/// One door sensor reading.
///
/// `open` means the magnetic sensor did not detect the door at the closed
/// position. It is a proxy for "not closed", not a true position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoorReading {
    #[serde(default)]
    pub channel: u8,
    #[serde(deserialize_with = "bool_from_int_or_bool")]
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Garage-door digest within the full system report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemDigest {
    #[serde(default, rename = "garageDoor")]
    pub garage_door: Vec<DoorReading>,
}

/// Full system report (`Appliance.System.All`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemAll {
    #[serde(default)]
    pub digest: SystemDigest,
}

/// Status payload carried by poll responses and push notifications.
///
/// Poll responses populate `all`; push notifications populate `state`.
/// Either reduces to the single sensor boolean via the accessors below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<SystemAll>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<DoorReading>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeviceFault>,
}

impl StatusPayload {
    /// Sensor flag from a poll response (`all.digest.garageDoor[0].open`).
    pub fn poll_sensor_open(&self) -> Option<bool> {
        self.all
            .as_ref()
            .and_then(|all| all.digest.garage_door.first())
            .map(|reading| reading.open)
    }

    /// Sensor flag from a push notification (`state[0].open`).
    pub fn push_sensor_open(&self) -> Option<bool> {
        self.state
            .as_ref()
            .and_then(|state| state.first())
            .map(|reading| reading.open)
    }
}

/// The firmware reports `open` as 0/1 on some models and as a bool on
/// others; accept both.
fn bool_from_int_or_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
        other => Err(serde::de::Error::custom(format!(
            "expected bool or integer for open flag, got {other}"
        ))),
    }
}

/// Build the control payload for a door command.
pub(crate) fn control_payload(channel: u8, open: bool, device_uuid: &str) -> serde_json::Value {
    serde_json::json!({
        "state": {
            "channel": channel,
            "open": if open { 1 } else { 0 },
            "uuid": device_uuid,
        }
    })
}
