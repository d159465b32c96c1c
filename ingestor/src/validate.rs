use crate::errors::{Error, Result};
use crate::model::{OtaCommand, OtaRequest, OtaStatusReport, TelemetryMessage, TelemetryRecord};
use crate::store::OTA_KEY_PREFIX;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

const TELEMETRY_FIELDS: &[&str] = &[
    "deviceId",
    "timestamp",
    "sensors",
    "battery",
    "rssi",
    "meshHopCount",
    "firmwareVersion",
];
const SENSOR_FIELDS: &[&str] = &["name", "type", "value", "unit"];
const OTA_STATUS_FIELDS: &[&str] = &["version", "state", "message", "timestamp"];
const OTA_REQUEST_FIELDS: &[&str] = &["version", "url", "checksum", "notes"];

/// `0001-01-01T00:00:00Z`, the zero instant some device SDKs send for an
/// unset clock.
const ZERO_INSTANT_SECS: i64 = -62_135_596_800;

/// Decodes a raw device message into a normalized telemetry record.
///
/// Field names match case-insensitively. A missing, `null`, blank or
/// zero-valued `timestamp` is replaced by `received_at`.
pub fn parse_telemetry(body: &[u8], received_at: DateTime<Utc>) -> Result<TelemetryRecord> {
    let mut value = parse_object(body)?;

    canonicalize_keys(&mut value, TELEMETRY_FIELDS);
    if let Some(Value::Array(sensors)) = value.get_mut("sensors") {
        for sensor in sensors.iter_mut() {
            canonicalize_keys(sensor, SENSOR_FIELDS);
        }
    }
    if let Some(map) = value.as_object_mut() {
        let blank = matches!(map.get("timestamp"), Some(Value::String(s)) if s.trim().is_empty());
        if blank {
            map.remove("timestamp");
        }
    }

    let mut message: TelemetryMessage = decode(value)?;
    validate_device_id(&message.device_id)?;
    if message.timestamp.is_some_and(is_unset_timestamp) {
        message.timestamp = None;
    }

    Ok(message.into_record(received_at))
}

/// The Unix epoch and the year-1 zero instant both mean "no clock yet".
fn is_unset_timestamp(timestamp: DateTime<Utc>) -> bool {
    timestamp == DateTime::<Utc>::default()
        || (timestamp.timestamp() == ZERO_INSTANT_SECS && timestamp.timestamp_subsec_nanos() == 0)
}

/// Device ids must be non-blank and must not collide with OTA status keys.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if device_id.starts_with(OTA_KEY_PREFIX) {
        return Err(Error::Validation(format!(
            "Device ID {:?} uses reserved prefix {:?}",
            device_id, OTA_KEY_PREFIX
        )));
    }

    Ok(())
}

pub fn parse_ota_report(body: &[u8]) -> Result<OtaStatusReport> {
    let mut value = parse_object(body)?;
    canonicalize_keys(&mut value, OTA_STATUS_FIELDS);
    let report: OtaStatusReport = decode(value)?;
    validate_ota_report(&report)?;
    Ok(report)
}

pub fn validate_ota_report(report: &OtaStatusReport) -> Result<()> {
    if report.state.trim().is_empty() {
        return Err(Error::Validation("Invalid OTA status: 'state' required".to_string()));
    }
    Ok(())
}

/// A device command is any JSON object; its contents are the device's business.
pub fn parse_command(body: &[u8]) -> Result<Value> {
    parse_object(body)
}

pub fn parse_ota_request(body: &[u8]) -> Result<OtaRequest> {
    let mut value = parse_object(body)?;
    canonicalize_keys(&mut value, OTA_REQUEST_FIELDS);
    decode(value)
}

/// Checks an OTA request and builds the command sent to the device.
pub fn validate_ota_request(request: &OtaRequest) -> Result<OtaCommand> {
    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());

    match url {
        Some(url) if !request.version.trim().is_empty() => Ok(OtaCommand {
            kind: "ota",
            version: request.version.clone(),
            url: url.to_string(),
            checksum: request.checksum.clone(),
        }),
        _ => Err(Error::Validation(
            "Invalid OTA request. 'version' and 'url' required.".to_string(),
        )),
    }
}

fn parse_object(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::Validation("Empty message".to_string()));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    if !value.is_object() {
        return Err(Error::Validation("Expected a JSON object".to_string()));
    }

    Ok(value)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Validation(format!("Invalid message: {}", e)))
}

/// Rewrites object keys that match a known field case-insensitively to the
/// canonical spelling. An exact-case key wins over a differently-cased one.
fn canonicalize_keys(value: &mut Value, fields: &[&str]) {
    let Value::Object(map) = value else {
        return;
    };

    let mut normalized = Map::with_capacity(map.len());
    for (key, v) in std::mem::take(map) {
        match fields.iter().find(|f| f.eq_ignore_ascii_case(&key)) {
            Some(canonical) if *canonical == key => {
                normalized.insert(key, v);
            }
            Some(canonical) => {
                normalized.entry(canonical.to_string()).or_insert(v);
            }
            None => {
                normalized.insert(key, v);
            }
        }
    }
    *map = normalized;
}
