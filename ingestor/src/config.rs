use crate::errors::StorageError;
use crate::pipeline::PipelineOptions;
use crate::store::{FileStore, PgStore, PgStoreOptions, Storage};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Storage backend picked once at startup: a connection string selects the
/// durable store, otherwise the local file store is used.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Postgres {
        url: String,
        options: PgStoreOptions,
    },
    File {
        data_dir: PathBuf,
    },
}

impl StoreBackend {
    pub async fn open(&self) -> Result<Arc<dyn Storage>, StorageError> {
        match self {
            StoreBackend::Postgres { url, options } => {
                info!("Using durable store at {}", redact_url(url));
                let store = PgStore::connect(url, options.clone()).await?;
                Ok(Arc::new(store))
            }
            StoreBackend::File { data_dir } => {
                info!("Using file store at {}", data_dir.display());
                Ok(Arc::new(FileStore::new(data_dir.clone())))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: StoreBackend,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub telemetry_topic: String,
    pub notify_prefix: String,
    pub http_addr: String,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub channel_capacity: usize,
    pub pipeline: PipelineOptions,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend = match lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => {
                let defaults = PgStoreOptions::default();
                StoreBackend::Postgres {
                    url,
                    options: PgStoreOptions {
                        partitions: parse_or(&lookup, "PG_PARTITIONS", defaults.partitions),
                        max_connections: parse_or(
                            &lookup,
                            "PG_MAX_CONNECTIONS",
                            defaults.max_connections,
                        ),
                        acquire_timeout: Duration::from_secs(parse_or(
                            &lookup,
                            "PG_ACQUIRE_TIMEOUT_SECS",
                            defaults.acquire_timeout.as_secs(),
                        )),
                        ..defaults
                    },
                }
            }
            None => StoreBackend::File {
                data_dir: lookup("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data")),
            },
        };

        Self {
            backend,
            mqtt_broker: lookup("MQTT_BROKER").unwrap_or_else(|| "localhost".to_string()),
            mqtt_port: parse_or(&lookup, "MQTT_PORT", 1883),
            telemetry_topic: lookup("TELEMETRY_TOPIC").unwrap_or_else(|| "telemetry/#".to_string()),
            notify_prefix: lookup("NOTIFY_PREFIX").unwrap_or_else(|| "notify".to_string()),
            http_addr: lookup("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            batch_size: parse_or(&lookup, "BATCH_SIZE", 2000),
            batch_timeout_ms: parse_or(&lookup, "BATCH_TIMEOUT_MS", 20),
            channel_capacity: parse_or(&lookup, "CHANNEL_CAPACITY", 100_000),
            pipeline: PipelineOptions {
                concurrency: parse_or(&lookup, "INGEST_CONCURRENCY", 1),
                monotonic_latest: parse_or(&lookup, "MONOTONIC_LATEST", false),
            },
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using {}", raw, key, default);
            default
        }),
        None => default,
    }
}

/// Hides credentials: keeps only what follows the last `@`.
pub fn redact_url(url: &str) -> &str {
    url.rsplit('@').next().unwrap_or("***")
}
