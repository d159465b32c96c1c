use crate::errors::{NotifyError, StorageError};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, INVALID_MESSAGES_TOTAL, MESSAGES_TOTAL, NOTIFY_FAILURES_TOTAL,
    STORAGE_FAILURES_TOTAL, STORED_MESSAGES_TOTAL,
};
use crate::model::TelemetryRecord;
use crate::notify::{device_scope, NotificationSink, TELEMETRY_EVENT};
use crate::store::Storage;
use crate::validate::parse_telemetry;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const LOG_PREVIEW_BYTES: usize = 128;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Messages of one batch processed at the same time.
    pub concurrency: usize,
    /// Use the conditional latest-state write so an older record arriving
    /// late cannot replace a newer one.
    pub monotonic_latest: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            monotonic_latest: false,
        }
    }
}

/// What happened to each message of a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub stored: usize,
    pub rejected: usize,
    pub failed: usize,
    pub notify_failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Stored { notified } => {
                self.stored += 1;
                if !notified {
                    self.notify_failed += 1;
                }
            }
            Outcome::Rejected => self.rejected += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Stored { notified: bool },
    Rejected,
    Failed,
}

/// Normalizes raw device messages, persists them and fans them out.
///
/// Every message is attempted independently: a bad or failing message is
/// logged and dropped without affecting the rest of the batch. Nothing is
/// retried.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn Storage>,
    sink: Arc<dyn NotificationSink>,
    options: PipelineOptions,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn Storage>,
        sink: Arc<dyn NotificationSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            sink,
            options,
        }
    }

    pub async fn ingest_batch(&self, messages: Vec<Vec<u8>>) -> BatchReport {
        let start = Instant::now();
        let mut report = BatchReport {
            received: messages.len(),
            ..Default::default()
        };

        if self.options.concurrency <= 1 {
            for message in &messages {
                report.record(self.ingest_message(message).await);
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
            let mut tasks = JoinSet::new();
            for message in messages {
                let pipeline = self.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    pipeline.ingest_message(&message).await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => {
                        error!("Ingestion task failed: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        INGEST_LATENCY_SECONDS.observe(elapsed);
        if report.received > 0 {
            info!(
                "Ingested batch in {:.3}s: received={} stored={} rejected={} failed={} notify_failed={}",
                elapsed,
                report.received,
                report.stored,
                report.rejected,
                report.failed,
                report.notify_failed
            );
        }

        report
    }

    async fn ingest_message(&self, body: &[u8]) -> Outcome {
        MESSAGES_TOTAL.inc();

        let record = match parse_telemetry(body, Utc::now()) {
            Ok(record) => record,
            Err(e) => {
                warn!("Dropping message: {} (body: {:?})", e, preview(body));
                INVALID_MESSAGES_TOTAL.inc();
                return Outcome::Rejected;
            }
        };

        // No transaction spans the two writes; both are always attempted.
        let inserted = self.store.insert_timeseries(&record).await;
        if let Err(e) = &inserted {
            storage_failure("insert_timeseries", &record, e);
        }

        let upserted = if self.options.monotonic_latest {
            self.store
                .upsert_latest_if_newer(&record)
                .await
                .map(|applied| {
                    if !applied {
                        debug!(
                            "Latest state for {} is newer than {}, kept",
                            record.device_id, record.timestamp
                        );
                    }
                })
        } else {
            self.store.upsert_latest(&record).await
        };
        if let Err(e) = &upserted {
            storage_failure("upsert_latest", &record, e);
        }

        if inserted.is_err() || upserted.is_err() {
            return Outcome::Failed;
        }

        STORED_MESSAGES_TOTAL.inc();
        debug!(
            "Stored telemetry for device {} at {}",
            record.device_id, record.timestamp
        );

        let notified = match self.notify(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to notify subscribers of {}: {}", record.device_id, e);
                NOTIFY_FAILURES_TOTAL.inc();
                false
            }
        };

        Outcome::Stored { notified }
    }

    async fn notify(&self, record: &TelemetryRecord) -> Result<(), NotifyError> {
        let payload = serde_json::to_value(record)?;
        self.sink
            .publish(&device_scope(&record.device_id), TELEMETRY_EVENT, &payload)
            .await
    }
}

fn storage_failure(operation: &str, record: &TelemetryRecord, e: &StorageError) {
    STORAGE_FAILURES_TOTAL.with_label_values(&[operation]).inc();
    if e.is_unavailable() {
        error!(
            "{} failed for device {}, backend unavailable: {}",
            operation, record.device_id, e
        );
    } else {
        error!("{} failed for device {}: {}", operation, record.device_id, e);
    }
}

fn preview(body: &[u8]) -> String {
    let end = body.len().min(LOG_PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}
