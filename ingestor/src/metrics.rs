use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total raw messages handed to the ingestion pipeline"
    ))
    .unwrap();
    pub static ref STORED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_stored_messages_total",
        "Total messages persisted to time series and latest state"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total invalid messages rejected"
    ))
    .unwrap();
    pub static ref STORAGE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_storage_failures_total",
            "Total storage write failures during ingestion"
        ),
        &["operation"]
    )
    .unwrap();
    pub static ref NOTIFY_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_notify_failures_total",
        "Total fan-out notifications that failed to publish"
    ))
    .unwrap();
    pub static ref SKIPPED_ROWS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_skipped_rows_total",
            "Total stored rows skipped on read because they could not be decoded"
        ),
        &["backend"]
    )
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to ingest a batch of messages"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Current batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times channel was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORAGE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(NOTIFY_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SKIPPED_ROWS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(CHANNEL_FULL_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
