//! Storage port and its backends.
//!
//! Every backend keeps two logical collections: an append-only time series
//! and a mutable per-device projection that holds both the latest telemetry
//! record and the OTA status. OTA entries are keyed by [`OTA_KEY_PREFIX`]
//! followed by the device id; ingestion rejects device ids that start with
//! the prefix so the two kinds of entry cannot collide.

pub mod file;
pub mod postgres;

use crate::errors::StorageError;
use crate::metrics::SKIPPED_ROWS_TOTAL;
use crate::model::{OtaStatus, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

pub use file::FileStore;
pub use postgres::{PgStore, PgStoreOptions};

pub const OTA_KEY_PREFIX: &str = "ota-";

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub fn ota_key(device_id: &str) -> String {
    format!("{}{}", OTA_KEY_PREFIX, device_id)
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends an immutable record. Never overwrites an existing one.
    async fn insert_timeseries(&self, record: &TelemetryRecord) -> StorageResult<()>;

    /// Replaces the latest state of `record.device_id`, last writer wins.
    async fn upsert_latest(&self, record: &TelemetryRecord) -> StorageResult<()>;

    /// Replaces the latest state only when the stored one is not newer than
    /// `record.timestamp`. Returns `false` when the stored state was kept.
    async fn upsert_latest_if_newer(&self, record: &TelemetryRecord) -> StorageResult<bool>;

    /// Records with `from <= timestamp <= to`, ascending by timestamp.
    async fn query_timeseries(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TelemetryRecord>>;

    async fn get_latest(&self, device_id: &str) -> StorageResult<Option<TelemetryRecord>>;

    /// One latest record per known device, ascending by device id.
    async fn list_devices(&self) -> StorageResult<Vec<TelemetryRecord>>;

    async fn set_ota_status(&self, device_id: &str, status: &OtaStatus) -> StorageResult<()>;

    async fn get_ota_status(&self, device_id: &str) -> StorageResult<Option<OtaStatus>>;

    /// Rows skipped on read because they could not be decoded.
    fn skipped_rows(&self) -> u64;
}

/// Counts rows a backend dropped while reading, per store and globally.
#[derive(Debug)]
pub(crate) struct SkipCounter {
    backend: &'static str,
    count: AtomicU64,
}

impl SkipCounter {
    pub(crate) fn new(backend: &'static str) -> Self {
        Self {
            backend,
            count: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        SKIPPED_ROWS_TOTAL.with_label_values(&[self.backend]).inc();
    }

    pub(crate) fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
