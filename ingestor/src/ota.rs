use crate::errors::{Error, Result};
use crate::metrics::NOTIFY_FAILURES_TOTAL;
use crate::model::{OtaCommand, OtaRequest, OtaStatus, OtaStatusReport};
use crate::notify::{device_scope, NotificationSink, OTA_COMMAND_EVENT, OTA_STATUS_EVENT};
use crate::store::Storage;
use crate::validate::{validate_device_id, validate_ota_report, validate_ota_request};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Tracks firmware update progress per device.
///
/// Reports overwrite the stored status unconditionally. The `state` label is
/// free-form: no ordering between pending, downloading, success and failed
/// is enforced.
#[derive(Clone)]
pub struct OtaTracker {
    store: Arc<dyn Storage>,
    sink: Arc<dyn NotificationSink>,
}

impl OtaTracker {
    pub fn new(store: Arc<dyn Storage>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Stores a device's report stamped with server time and notifies
    /// subscribers of the device. Notification is best-effort.
    pub async fn report_status(&self, device_id: &str, report: OtaStatusReport) -> Result<OtaStatus> {
        validate_device_id(device_id)?;
        validate_ota_report(&report)?;

        let status = report.into_status(Utc::now());
        self.store.set_ota_status(device_id, &status).await?;
        info!(
            "OTA status for {}: version={} state={}",
            device_id, status.version, status.state
        );

        let published = match serde_json::to_value(&status) {
            Ok(payload) => self
                .sink
                .publish(&device_scope(device_id), OTA_STATUS_EVENT, &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = published {
            warn!("Failed to notify OTA status for {}: {}", device_id, e);
            NOTIFY_FAILURES_TOTAL.inc();
        }

        Ok(status)
    }

    pub async fn current_status(&self, device_id: &str) -> Result<Option<OtaStatus>> {
        Ok(self.store.get_ota_status(device_id).await?)
    }

    /// Sends an update command to the device. Unlike status fan-out, a
    /// delivery failure here is returned: the command is the whole point.
    pub async fn request_update(&self, device_id: &str, request: &OtaRequest) -> Result<OtaCommand> {
        validate_device_id(device_id)?;
        let command = validate_ota_request(request)?;

        let payload = serde_json::to_value(&command)?;
        self.sink
            .publish(&device_scope(device_id), OTA_COMMAND_EVENT, &payload)
            .await
            .map_err(Error::Notify)?;
        info!(
            "OTA update to {} requested for {} ({})",
            command.version, device_id, command.url
        );

        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastSink;
    use crate::store::FileStore;
    use chrono::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BroadcastSink, OtaTracker) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        let sink = BroadcastSink::new(16);
        let tracker = OtaTracker::new(store, Arc::new(sink.clone()));
        (tmp, sink, tracker)
    }

    #[tokio::test]
    async fn test_status_not_found_before_report() {
        let (_tmp, _sink, tracker) = setup();
        assert!(tracker.current_status("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_stamps_server_time() {
        let (_tmp, _sink, tracker) = setup();
        let before = Utc::now();

        tracker
            .report_status("s1", OtaStatusReport::new("1.2.0", "downloading"))
            .await
            .unwrap();

        let status = tracker.current_status("s1").await.unwrap().unwrap();
        assert_eq!(status.state, "downloading");
        assert_eq!(status.version, "1.2.0");
        assert!(status.timestamp >= before);
        assert!(Utc::now() - status.timestamp < Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_report_overwrites_without_transition_checks() {
        let (_tmp, _sink, tracker) = setup();

        tracker
            .report_status("s1", OtaStatusReport::new("1.2.0", "success"))
            .await
            .unwrap();
        tracker
            .report_status("s1", OtaStatusReport::new("1.2.0", "pending"))
            .await
            .unwrap();

        let status = tracker.current_status("s1").await.unwrap().unwrap();
        assert_eq!(status.state, "pending");
    }

    #[tokio::test]
    async fn test_report_notifies_device_scope() {
        let (_tmp, sink, tracker) = setup();
        let mut rx = sink.subscribe();

        tracker
            .report_status("s1", OtaStatusReport::new("1.2.0", "failed"))
            .await
            .unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.scope, "device:s1");
        assert_eq!(notification.event, OTA_STATUS_EVENT);
        assert_eq!(notification.payload["state"], "failed");
    }

    #[tokio::test]
    async fn test_report_validation() {
        let (_tmp, _sink, tracker) = setup();

        let blank_state = tracker
            .report_status("s1", OtaStatusReport::new("1.2.0", " "))
            .await;
        assert!(matches!(blank_state, Err(Error::Validation(_))));

        let blank_device = tracker
            .report_status("", OtaStatusReport::new("1.2.0", "pending"))
            .await;
        assert!(matches!(blank_device, Err(Error::Validation(_))));
        assert!(tracker.current_status("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_update_publishes_command() {
        let (_tmp, sink, tracker) = setup();
        let mut rx = sink.subscribe();

        let request = OtaRequest {
            version: "1.3.0".to_string(),
            url: Some("https://fw.example/1.3.0.bin".to_string()),
            checksum: Some("sha256:abc".to_string()),
            notes: Some("moisture calibration".to_string()),
        };
        let command = tracker.request_update("s1", &request).await.unwrap();
        assert_eq!(command.version, "1.3.0");

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event, OTA_COMMAND_EVENT);
        assert_eq!(notification.payload["type"], "ota");
        assert_eq!(notification.payload["url"], "https://fw.example/1.3.0.bin");
        assert!(notification.payload.get("notes").is_none());

        // Requests are never persisted as status.
        assert!(tracker.current_status("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_update_requires_url() {
        let (_tmp, _sink, tracker) = setup();
        let request = OtaRequest {
            version: "1.3.0".to_string(),
            ..Default::default()
        };
        assert!(tracker.request_update("s1", &request).await.is_err());
    }
}
