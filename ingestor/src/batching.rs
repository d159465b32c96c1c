use crate::metrics::BATCH_SIZE;
use crate::pipeline::IngestPipeline;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

/// Collects raw messages and hands them to the pipeline when `max_batch`
/// is reached or every `max_wait_ms`, whichever comes first.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<Vec<u8>>,
    pipeline: IngestPipeline,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<Vec<u8>> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(m) => {
                        buffer.push(m);

                        if buffer.len() >= max_batch {
                            flush_batch(&pipeline, &mut buffer, max_batch).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(&pipeline, &mut buffer, max_batch).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&pipeline, &mut buffer, max_batch).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(pipeline: &IngestPipeline, buffer: &mut Vec<Vec<u8>>, max_batch: usize) {
    if buffer.is_empty() {
        return;
    }

    let batch = std::mem::replace(buffer, Vec::with_capacity(max_batch));
    debug!("Flushing batch of {} messages", batch.len());
    BATCH_SIZE.set(batch.len() as f64);

    // The pipeline never fails a batch as a whole and never retries.
    pipeline.ingest_batch(batch).await;

    BATCH_SIZE.set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastSink;
    use crate::pipeline::PipelineOptions;
    use crate::store::{FileStore, Storage};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flushes_remaining_on_close() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(BroadcastSink::new(8)),
            PipelineOptions::default(),
        );
        let (tx, rx) = mpsc::channel(16);

        // Large batch and long wait: only the close can trigger the flush.
        let batcher = tokio::spawn(run_batcher(rx, pipeline, 100, 60_000));
        for id in ["s2", "s1"] {
            let body = format!(r#"{{"deviceId":"{}"}}"#, id);
            tx.send(body.into_bytes()).await.unwrap();
        }
        tx.send(b"{malformed".to_vec()).await.unwrap();
        drop(tx);
        batcher.await.unwrap();

        let ids: Vec<String> = store
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.device_id)
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_flushes_when_batch_full() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(BroadcastSink::new(8)),
            PipelineOptions::default(),
        );
        let (tx, rx) = mpsc::channel(16);
        let batcher = tokio::spawn(run_batcher(rx, pipeline, 2, 60_000));

        tx.send(br#"{"deviceId":"s1"}"#.to_vec()).await.unwrap();
        tx.send(br#"{"deviceId":"s2"}"#.to_vec()).await.unwrap();

        let mut stored = 0;
        for _ in 0..100 {
            stored = store.list_devices().await.unwrap().len();
            if stored == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 2);

        drop(tx);
        batcher.await.unwrap();
    }
}
