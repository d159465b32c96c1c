use crate::errors::{Error, Result};
use crate::notify::{device_scope, NotificationSink, COMMAND_EVENT};
use crate::validate::validate_device_id;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Forwards free-form commands to a device. Nothing is persisted.
#[derive(Clone)]
pub struct DeviceCommander {
    sink: Arc<dyn NotificationSink>,
}

impl DeviceCommander {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Publishes `command` to the device scope. A delivery failure is
    /// returned to the caller.
    pub async fn send_command(&self, device_id: &str, command: &Value) -> Result<()> {
        validate_device_id(device_id)?;
        if !command.is_object() {
            return Err(Error::Validation("Command must be a JSON object".to_string()));
        }

        self.sink
            .publish(&device_scope(device_id), COMMAND_EVENT, command)
            .await
            .map_err(Error::Notify)?;
        info!("Command sent to {}", device_id);

        Ok(())
    }
}
