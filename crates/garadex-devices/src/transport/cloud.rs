//! Cloud MQTT transport.
//!
//! The vendor cloud bridges an MQTT broker between the app and the device:
//! we publish signed messages to the device's topic and receive replies
//! and unsolicited push notifications on the account topic. Replies are
//! matched to requests by message id; everything else with a `PUSH` method
//! is fanned out to notification subscribers.
//!
//! Note the feedback hazard this creates: the device echoes our own
//! commands back as push notifications. Suppressing that echo is the
//! controller's job (the ignore window), not the transport's.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::{
    control_payload, namespaces, Message, MessageHeader, StatusPayload, Transport, TransportKind,
};
use crate::error::DeviceError;

/// Consecutive connection errors tolerated before the event loop stops.
const MAX_CONNECTION_ERRORS: u32 = 5;

/// Configuration for a cloud MQTT transport.
#[derive(Debug, Clone)]
pub struct CloudTransportConfig {
    /// Device hardware UUID (topic segment and control payload field).
    pub device_uuid: String,
    /// Cloud account user id (topic segment and broker username).
    pub user_id: String,
    /// Cloud account key, used for header signing and broker credentials.
    pub key: String,
    /// Broker hostname, from the device record's domain.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
    /// Whether to wrap the connection in TLS.
    pub tls: bool,
    /// How long to wait for a reply to a published request, in seconds.
    /// Kept under the command queue's unit timeout so the failure surfaces
    /// as a transport error rather than a queue timeout.
    pub response_timeout_secs: u64,
}

impl CloudTransportConfig {
    pub fn new(
        device_uuid: impl Into<String>,
        user_id: impl Into<String>,
        key: impl Into<String>,
        broker_host: impl Into<String>,
    ) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            user_id: user_id.into(),
            key: key.into(),
            broker_host: broker_host.into(),
            broker_port: 443,
            tls: true,
            response_timeout_secs: 9,
        }
    }
}

/// Unsolicited notification pushed by the device.
#[derive(Debug, Clone)]
pub struct PushNotification {
    pub namespace: String,
    pub payload: StatusPayload,
}

/// Push-capable transport over the vendor cloud's MQTT broker.
pub struct CloudTransport {
    config: CloudTransportConfig,
    client: AsyncClient,
    /// In-flight requests awaiting a reply, keyed by message id.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<StatusPayload>>>>,
    push_tx: broadcast::Sender<PushNotification>,
    running: Arc<AtomicBool>,
}

impl CloudTransport {
    /// Connect to the broker, subscribe to the account topic and spawn the
    /// event loop task.
    pub async fn connect(config: CloudTransportConfig) -> Result<Self, DeviceError> {
        let client_id = format!("app:garadex-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        // Broker credentials: account user id and the md5 of user id + key.
        options.set_credentials(
            &config.user_id,
            format!(
                "{:x}",
                md5::compute(format!("{}{}", config.user_id, config.key))
            ),
        );
        if config.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let app_topic = Self::app_topic(&config.user_id);
        client
            .subscribe(&app_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?;

        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<StatusPayload>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, _) = broadcast::channel(64);
        let running = Arc::new(AtomicBool::new(true));

        let loop_pending = pending.clone();
        let loop_push_tx = push_tx.clone();
        let loop_running = running.clone();
        let device_uuid = config.device_uuid.clone();
        tokio::spawn(async move {
            let mut error_count = 0u32;
            while loop_running.load(Ordering::Acquire) {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        error_count = 0;
                        Self::handle_publish(&publish.payload, &loop_pending, &loop_push_tx).await;
                    }
                    Ok(_) => {
                        error_count = 0;
                    }
                    Err(e) => {
                        if !loop_running.load(Ordering::Acquire) {
                            break;
                        }
                        error_count += 1;
                        if error_count >= MAX_CONNECTION_ERRORS {
                            error!(
                                device = %device_uuid,
                                error = %e,
                                "cloud connection error count reached {MAX_CONNECTION_ERRORS}, stopping"
                            );
                            break;
                        }
                        warn!(
                            device = %device_uuid,
                            error = %e,
                            "cloud connection error ({error_count}/{MAX_CONNECTION_ERRORS})"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!(device = %device_uuid, "cloud connection closed");
        });

        Ok(Self {
            config,
            client,
            pending,
            push_tx,
            running,
        })
    }

    fn app_topic(user_id: &str) -> String {
        format!("/app/{user_id}/subscribe")
    }

    fn device_topic(&self) -> String {
        format!("/appliance/{}/subscribe", self.config.device_uuid)
    }

    /// Route an incoming publish: a reply to an in-flight request, a push
    /// notification, or noise.
    async fn handle_publish(
        bytes: &[u8],
        pending: &Mutex<HashMap<String, oneshot::Sender<StatusPayload>>>,
        push_tx: &broadcast::Sender<PushNotification>,
    ) {
        let message: Message = match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding unparseable cloud message");
                return;
            }
        };
        let payload: StatusPayload = match serde_json::from_value(message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    namespace = %message.header.namespace,
                    error = %e,
                    "discarding cloud message with unexpected payload shape"
                );
                return;
            }
        };

        if let Some(reply_tx) = pending.lock().await.remove(&message.header.message_id) {
            let _ = reply_tx.send(payload);
            return;
        }

        if message.header.method == "PUSH" {
            debug!(namespace = %message.header.namespace, "incoming push notification");
            let _ = push_tx.send(PushNotification {
                namespace: message.header.namespace,
                payload,
            });
        }
    }

    /// Publish a signed request and wait for the reply matching its
    /// message id.
    async fn round_trip(
        &self,
        method: &str,
        namespace: &str,
        payload: serde_json::Value,
    ) -> Result<StatusPayload, DeviceError> {
        let header = MessageHeader::new(
            method,
            namespace,
            &self.config.key,
            Some(Self::app_topic(&self.config.user_id)),
        );
        let message_id = header.message_id.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(message_id.clone(), reply_tx);

        let body = serde_json::to_vec(&Message { header, payload })?;
        if let Err(e) = self
            .client
            .publish(self.device_topic(), QoS::AtLeastOnce, false, body)
            .await
        {
            self.pending.lock().await.remove(&message_id);
            return Err(DeviceError::Transport(e.to_string()));
        }

        let bound = Duration::from_secs(self.config.response_timeout_secs);
        match tokio::time::timeout(bound, reply_rx).await {
            Ok(Ok(payload)) => {
                if let Some(fault) = &payload.error {
                    return Err(DeviceError::CommandFailed(fault.to_string()));
                }
                Ok(payload)
            }
            Ok(Err(_)) => Err(DeviceError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&message_id);
                Err(DeviceError::Timeout(bound))
            }
        }
    }

    /// Subscribe to unsolicited push notifications.
    ///
    /// Returns a stream; multiple subscribers are supported. A lagged
    /// subscriber skips dropped notifications and keeps receiving.
    pub fn notifications(&self) -> Pin<Box<dyn Stream<Item = PushNotification> + Send>> {
        let mut rx = self.push_tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(notification) => yield notification,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop the event loop and disconnect from the broker.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Transport for CloudTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cloud
    }

    async fn send_control(&self, open: bool) -> Result<(), DeviceError> {
        let payload = control_payload(0, open, &self.config.device_uuid);
        self.round_trip("SET", namespaces::GARAGE_DOOR_STATE, payload)
            .await?;
        Ok(())
    }

    async fn request_status(&self) -> Result<StatusPayload, DeviceError> {
        self.round_trip("GET", namespaces::SYSTEM_ALL, serde_json::json!({}))
            .await
    }
}
