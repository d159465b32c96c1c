use axum::{routing::get, Router};
use soil_ingestor::command::DeviceCommander;
use soil_ingestor::config::Config;
use soil_ingestor::notify::{MqttSink, NotificationSink};
use soil_ingestor::ota::OtaTracker;
use soil_ingestor::pipeline::IngestPipeline;
use soil_ingestor::rest::{self, AppState};
use soil_ingestor::{batching, metrics, mqtt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting soil telemetry ingestor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    // A store that cannot be constructed is fatal at startup.
    let store = match config.backend.open().await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open storage backend: {}", e);
            std::process::exit(1);
        }
    };

    let client_id = format!("ingestor-{}", uuid::Uuid::new_v4());
    let (client, eventloop) = mqtt::connect(&config.mqtt_broker, config.mqtt_port, &client_id);
    let sink: Arc<dyn NotificationSink> =
        Arc::new(MqttSink::new(client.clone(), config.notify_prefix.clone()));

    let pipeline = IngestPipeline::new(store.clone(), sink.clone(), config.pipeline.clone());
    let ota = OtaTracker::new(store.clone(), sink.clone());
    let commander = DeviceCommander::new(sink);

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let topic = config.telemetry_topic.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(client, eventloop, topic, tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let batcher_pipeline = pipeline.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_pipeline, batch_size, batch_timeout_ms).await;
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState::new(store, pipeline, ota, commander)));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
