//! Direct HTTP transport for devices on the local network.
//!
//! Commands and status requests are synchronous round-trips to the
//! device's `/config` endpoint. Responses carry the same signed envelope
//! as the cloud channel; an `ERROR` method or an `error` field in the
//! payload is surfaced as an explicit command failure, never treated as
//! success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{
    control_payload, namespaces, Message, MessageHeader, StatusPayload, Transport, TransportKind,
};
use crate::error::DeviceError;

/// Configuration for a local HTTP transport.
#[derive(Debug, Clone)]
pub struct LocalTransportConfig {
    /// Device IP address or hostname.
    pub host: String,
    /// Shared device key used to sign message headers.
    pub key: String,
    /// Device hardware UUID, echoed in control payloads.
    pub device_uuid: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl LocalTransportConfig {
    pub fn new(
        host: impl Into<String>,
        key: impl Into<String>,
        device_uuid: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            device_uuid: device_uuid.into(),
            timeout_secs: 9,
        }
    }
}

/// Local-network transport speaking signed JSON over HTTP.
pub struct LocalTransport {
    config: LocalTransportConfig,
    client: Client,
}

impl LocalTransport {
    /// Create a transport for one device.
    pub fn new(config: LocalTransportConfig) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// One signed request/response round-trip.
    async fn execute(
        &self,
        method: &str,
        namespace: &str,
        payload: serde_json::Value,
    ) -> Result<StatusPayload, DeviceError> {
        let message = Message {
            header: MessageHeader::new(method, namespace, &self.config.key, None),
            payload,
        };
        let url = format!("http://{}/config", self.config.host);
        debug!(url = %url, namespace = %namespace, method = %method, "local request");

        let response = self
            .client
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeviceError::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    DeviceError::Transport(e.to_string())
                }
            })?;

        let reply: Message = response
            .json()
            .await
            .map_err(|e| DeviceError::MalformedResponse(e.to_string()))?;

        let payload: StatusPayload = serde_json::from_value(reply.payload)
            .map_err(|e| DeviceError::MalformedResponse(e.to_string()))?;

        if reply.header.method == "ERROR" {
            let detail = payload
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "request failed".to_string());
            return Err(DeviceError::CommandFailed(detail));
        }
        if let Some(fault) = &payload.error {
            return Err(DeviceError::CommandFailed(fault.to_string()));
        }
        Ok(payload)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    async fn send_control(&self, open: bool) -> Result<(), DeviceError> {
        let payload = control_payload(0, open, &self.config.device_uuid);
        self.execute("SET", namespaces::GARAGE_DOOR_STATE, payload)
            .await?;
        Ok(())
    }

    async fn request_status(&self) -> Result<StatusPayload, DeviceError> {
        self.execute("GET", namespaces::SYSTEM_ALL, serde_json::json!({}))
            .await
    }
}
