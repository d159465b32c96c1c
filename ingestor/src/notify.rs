//! Fan-out of live updates to subscribers.
//!
//! The pipeline and the OTA tracker publish to a scope per device
//! (`device:<id>`); who is subscribed to a scope is the transport's business.

use crate::errors::NotifyError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

pub const TELEMETRY_EVENT: &str = "telemetryReceived";
pub const OTA_STATUS_EVENT: &str = "otaStatus";
pub const OTA_COMMAND_EVENT: &str = "ota";
pub const COMMAND_EVENT: &str = "command";

pub fn device_scope(device_id: &str) -> String {
    format!("device:{}", device_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub scope: String,
    pub event: String,
    pub payload: Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, scope: &str, event: &str, payload: &Value) -> Result<(), NotifyError>;
}

/// Publishes each notification as JSON to `<prefix>/<scope>/<event>`.
///
/// Publishing never waits for room in the client's request queue: a full or
/// closed queue is returned as an error so a stalled broker cannot hold up
/// ingestion.
pub struct MqttSink {
    client: AsyncClient,
    prefix: String,
}

impl MqttSink {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn topic(&self, scope: &str, event: &str) -> String {
        format!("{}/{}/{}", self.prefix, scope, event)
    }
}

#[async_trait]
impl NotificationSink for MqttSink {
    async fn publish(&self, scope: &str, event: &str, payload: &Value) -> Result<(), NotifyError> {
        let topic = self.topic(scope, event);
        let bytes = serde_json::to_vec(payload)?;
        debug!("Publishing {} bytes to {}", bytes.len(), topic);
        self.client.try_publish(topic, QoS::AtLeastOnce, false, bytes)?;
        Ok(())
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, scope: &str, event: &str, payload: &Value) -> Result<(), NotifyError> {
        let notification = Notification {
            scope: scope.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        // No receivers is not a failure: nobody is listening yet.
        let _ = self.tx.send(notification);
        Ok(())
    }
}
