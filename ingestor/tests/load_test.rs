//! Broker load tests. They need a running broker and ingestor:
//! `cargo test --test load_test -- --ignored --nocapture`

use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn random_telemetry(rng: &mut impl Rng, device_id: &str) -> Value {
    json!({
        "deviceId": device_id,
        "timestamp": "",
        "sensors": [
            {"name": "moisture1", "type": "capacitive", "value": rng.gen_range(20.0..60.0), "unit": "%"},
            {"name": "soilTemp", "value": rng.gen_range(5.0..30.0), "unit": "C"}
        ],
        "battery": rng.gen_range(3.3..4.2),
        "rssi": rng.gen_range(-95..-40),
        "meshHopCount": rng.gen_range(0..4),
        "firmwareVersion": "1.0.0"
    })
}

async fn connect(client_id: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(client_id, "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20_000);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });

    sleep(Duration::from_millis(500)).await;
    client
}

struct LoadResult {
    sent: usize,
    errors: usize,
    rate: f64,
}

/// Publishes at `target_rate` in bursts of 100, one message in
/// `malformed_every` replaced by a body without a device id.
async fn publish_load(
    client: &AsyncClient,
    devices: usize,
    total_messages: usize,
    target_rate: u64,
    malformed_every: Option<usize>,
) -> LoadResult {
    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size as u64 * 1_000_000) / target_rate);
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    let mut sent = 0;
    let mut errors = 0;

    for batch_start in (0..total_messages).step_by(burst_size) {
        for i in batch_start..std::cmp::min(batch_start + burst_size, total_messages) {
            let device_id = format!("load-node-{}", i % devices);
            let payload = match malformed_every {
                Some(n) if i % n == 0 => r#"{"sensors": []}"#.to_string(),
                _ => random_telemetry(&mut rng, &device_id).to_string(),
            };

            match client
                .publish(
                    format!("telemetry/{}", device_id),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                )
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => {
                    errors += 1;
                    if errors < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }

        sleep(delay_per_burst).await;

        if (batch_start + burst_size) % 5000 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "{} msgs ({:.0} msg/s)",
                batch_start + burst_size,
                (batch_start + burst_size) as f64 / elapsed
            );
        }
    }

    LoadResult {
        sent,
        errors,
        rate: sent as f64 / start.elapsed().as_secs_f64(),
    }
}

#[tokio::test]
#[ignore]
async fn test_500_messages_per_second() {
    let client = connect("load-test").await;
    let total = 5_000;

    let result = publish_load(&client, 20, total, 500, None).await;

    println!(
        "Sent {} / {} at {:.2} msg/s, {} errors",
        result.sent, total, result.rate, result.errors
    );
    assert!(
        result.rate >= 450.0,
        "Throughput too low: {:.2} msg/s (expected >= 450)",
        result.rate
    );
    assert_eq!(result.errors, 0);
}

#[tokio::test]
#[ignore]
async fn test_sustained_load_with_malformed_messages() {
    let client = connect("load-test-sustained").await;
    let total = 30_000;

    let result = publish_load(&client, 50, total, 500, Some(50)).await;

    println!(
        "Sent {} / {} at {:.2} msg/s, {} errors",
        result.sent, total, result.rate, result.errors
    );
    assert!(result.rate >= 450.0);
    assert_eq!(result.errors, 0);
}
