use rand::Rng;
use serde::Serialize;

/// Payload as the field nodes send it. The timestamp is left blank so the
/// backend stamps the reading on arrival.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTelemetry {
    pub device_id: String,
    pub timestamp: String,
    pub sensors: Vec<Sensor>,
    pub battery: f64,
    pub rssi: i32,
    pub mesh_hop_count: u32,
    pub firmware_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub unit: String,
}

impl Sensor {
    fn new(name: &str, kind: &str, value: f64, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

pub fn generate_telemetry(rng: &mut impl Rng, device_id: String, firmware: &str) -> NodeTelemetry {
    let moisture = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0) // 5% outliers
    } else {
        rng.gen_range(25.0..60.0)
    };

    let temperature = rng.gen_range(5.0..30.0);

    let battery = if rng.gen_bool(0.02) {
        rng.gen_range(3.0..3.3) // 2% low battery
    } else {
        rng.gen_range(3.3..4.2)
    };

    NodeTelemetry {
        device_id,
        timestamp: String::new(),
        sensors: vec![
            Sensor::new("moisture1", "capacitive", moisture, "%"),
            Sensor::new("soilTemp", "ds18b20", temperature, "C"),
        ],
        battery,
        rssi: rng.gen_range(-95..-40),
        mesh_hop_count: rng.gen_range(0..4),
        firmware_version: firmware.to_string(),
    }
}

/// Payloads the backend must reject without affecting the rest of a batch.
pub fn malformed_payload(rng: &mut impl Rng) -> String {
    match rng.gen_range(0..3) {
        0 => String::new(),
        1 => "{\"deviceId\": ".to_string(),
        _ => "{\"sensors\": []}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_payload_uses_camel_case_and_blank_timestamp() {
        let mut rng = rand::thread_rng();
        let telemetry = generate_telemetry(&mut rng, "node-1".to_string(), "1.0.0");
        let value: Value = serde_json::to_value(&telemetry).unwrap();

        assert_eq!(value["deviceId"], "node-1");
        assert_eq!(value["timestamp"], "");
        assert_eq!(value["firmwareVersion"], "1.0.0");
        assert!(value.get("meshHopCount").is_some());
        assert_eq!(value["sensors"][0]["type"], "capacitive");
    }

    #[test]
    fn test_readings_stay_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let telemetry = generate_telemetry(&mut rng, "n".to_string(), "1.0.0");
            assert!((0.0..100.0).contains(&telemetry.sensors[0].value));
            assert!((3.0..4.2).contains(&telemetry.battery));
            assert!((-95..-40).contains(&telemetry.rssi));
            assert!(telemetry.mesh_hop_count < 4);
        }
    }

    #[test]
    fn test_malformed_payloads_lack_a_device() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let payload = malformed_payload(&mut rng);
            let parsed: Option<Value> = serde_json::from_str(&payload).ok();
            assert!(parsed.map_or(true, |v| v.get("deviceId").is_none()));
        }
    }
}
