use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped reading batch from a field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sensors: Vec<SensorReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_hop_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SensorReading {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: None,
            value,
            unit: None,
        }
    }
}

/// Telemetry as it arrives from a device: the timestamp may be missing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sensors: Vec<SensorReading>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub mesh_hop_count: Option<i32>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

impl TelemetryMessage {
    /// Stamps `received_at` when the device did not supply a timestamp.
    pub fn into_record(self, received_at: DateTime<Utc>) -> TelemetryRecord {
        TelemetryRecord {
            device_id: self.device_id,
            timestamp: self.timestamp.unwrap_or(received_at),
            sensors: self.sensors,
            battery: self.battery,
            rssi: self.rssi,
            mesh_hop_count: self.mesh_hop_count,
            firmware_version: self.firmware_version,
        }
    }
}

/// Latest-state projection, one per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLatestState {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub latest: TelemetryRecord,
}

impl From<TelemetryRecord> for DeviceLatestState {
    fn from(record: TelemetryRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            last_seen: record.timestamp,
            latest: record,
        }
    }
}

/// Reported progress of a firmware update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtaStatus {
    pub version: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Inbound OTA status report. Any client timestamp is dropped on decode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OtaStatusReport {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl OtaStatusReport {
    pub fn new(version: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            state: state.into(),
            message: None,
        }
    }

    pub fn into_status(self, reported_at: DateTime<Utc>) -> OtaStatus {
        OtaStatus {
            version: self.version,
            state: self.state,
            message: self.message,
            timestamp: reported_at,
        }
    }
}

/// Firmware update instruction for a device. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtaRequest {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Payload delivered to a device to start an update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaCommand {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub version: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Response wrapper for time series reads
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesResponse {
    pub device_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total: usize,
    pub data: Vec<TelemetryRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_serializes_camel_case_and_omits_absent_fields() {
        let record = TelemetryRecord {
            device_id: "s1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            sensors: vec![SensorReading {
                name: "moisture1".to_string(),
                kind: Some("capacitive".to_string()),
                value: 42.5,
                unit: Some("%".to_string()),
            }],
            battery: Some(3.7),
            rssi: None,
            mesh_hop_count: Some(2),
            firmware_version: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["deviceId"], "s1");
        assert_eq!(json["meshHopCount"], 2);
        assert_eq!(json["sensors"][0]["type"], "capacitive");
        assert!(json.get("rssi").is_none());
        assert!(json.get("firmwareVersion").is_none());
    }

    #[test]
    fn test_message_keeps_device_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let message: TelemetryMessage = serde_json::from_str(
            r#"{"deviceId":"s1","timestamp":"2024-05-01T12:00:00Z","sensors":[]}"#,
        )
        .unwrap();

        let record = message.into_record(Utc::now());
        assert_eq!(record.timestamp, ts);
    }

    #[test]
    fn test_latest_state_tracks_record_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let message: TelemetryMessage = serde_json::from_str(r#"{"deviceId":"s1"}"#).unwrap();
        let state = DeviceLatestState::from(message.into_record(ts));

        assert_eq!(state.device_id, "s1");
        assert_eq!(state.last_seen, ts);
        assert_eq!(state.latest.timestamp, ts);
    }

    #[test]
    fn test_ota_report_ignores_client_timestamp() {
        let report: OtaStatusReport = serde_json::from_str(
            r#"{"version":"1.2.0","state":"downloading","timestamp":"2001-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let now = Utc::now();
        let status = report.into_status(now);

        assert_eq!(status.state, "downloading");
        assert_eq!(status.timestamp, now);
    }
}
