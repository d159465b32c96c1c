mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::{generate_telemetry, malformed_payload};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes soil telemetry for a fleet of simulated field nodes.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Messages per second across all nodes.
    #[arg(long, env = "RATE", default_value_t = 100)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 20)]
    devices: u64,

    /// Share of messages sent malformed, between 0 and 1.
    #[arg(long, env = "MALFORMED_RATIO", default_value_t = 0.0)]
    malformed_ratio: f64,

    #[arg(long, env = "FIRMWARE_VERSION", default_value = "1.0.0")]
    firmware: String,
}

const BURST_SIZE: u64 = 20;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let rate = args.rate.max(1);
    let devices = args.devices.max(1);
    let malformed_ratio = if args.malformed_ratio.is_nan() {
        0.0
    } else {
        args.malformed_ratio.clamp(0.0, 1.0)
    };

    info!("Starting node simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, rate, devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10_000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let burst_interval = Duration::from_millis(BURST_SIZE * 1000 / rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = format!("node-{}", counter % devices);
            let topic = format!("telemetry/{}", device_id);

            let payload = if rng.gen_bool(malformed_ratio) {
                malformed_payload(&mut rng)
            } else {
                let telemetry = generate_telemetry(&mut rng, device_id, &args.firmware);
                match serde_json::to_string(&telemetry) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => counter += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if counter % 1000 < BURST_SIZE {
            info!("Published {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!("Burst took {:?}, target was {:?}", elapsed, burst_interval);
        }
    }
}
