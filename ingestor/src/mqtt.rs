use crate::errors::{Error, Result};
use crate::metrics::CHANNEL_FULL_TOTAL;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub fn connect(broker: &str, port: u16, client_id: &str) -> (AsyncClient, EventLoop) {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    AsyncClient::new(mqtt_options, 10000)
}

/// Subscribes to `topic` and forwards every raw payload to the batcher.
/// Payloads are not inspected here; normalization belongs to the pipeline.
pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                forward(publish.payload.to_vec(), &tx).await?;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Hands a payload to the batcher, waiting for room when the channel is full.
async fn forward(payload: Vec<u8>, tx: &mpsc::Sender<Vec<u8>>) -> Result<()> {
    match tx.try_send(payload) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(payload)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(payload).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot forward message");
            Err(Error::ChannelSend)
        }
    }
}
