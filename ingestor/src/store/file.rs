//! Local directory-tree backend, used for tests and offline operation.
//!
//! Layout under the root:
//!
//! ```text
//! timeseries/<deviceId>/<yyyyMMddTHHmmssfff>[-n].json
//! latest/<deviceId>.json
//! latest/ota-<deviceId>.json
//! ```

use super::{ota_key, SkipCounter, Storage, StorageResult, OTA_KEY_PREFIX};
use crate::errors::StorageError;
use crate::model::{DeviceLatestState, OtaStatus, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const TIMESERIES_DIR: &str = "timeseries";
const LATEST_DIR: &str = "latest";

pub struct FileStore {
    root: PathBuf,
    skips: SkipCounter,
    // One lock per device serializes read-compare-write in
    // `upsert_latest_if_newer`; other devices are not held up.
    latest_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Directories are created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            skips: SkipCounter::new("file"),
            latest_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn latest_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .latest_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(device_id.to_string()).or_default().clone()
    }

    fn device_dir(&self, device_id: &str) -> StorageResult<PathBuf> {
        check_key(device_id)?;
        Ok(self.root.join(TIMESERIES_DIR).join(device_id))
    }

    fn latest_dir(&self) -> PathBuf {
        self.root.join(LATEST_DIR)
    }

    fn latest_path(&self, key: &str) -> StorageResult<PathBuf> {
        check_key(key)?;
        Ok(self.latest_dir().join(format!("{}.json", key)))
    }

    async fn read_state(&self, path: &Path) -> StorageResult<Option<DeviceLatestState>> {
        match read_optional(path).await? {
            Some(bytes) => decode_point::<DeviceLatestState>(path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write_state(&self, record: &TelemetryRecord) -> StorageResult<()> {
        let path = self.latest_path(&record.device_id)?;
        let state = DeviceLatestState::from(record.clone());
        write_atomic(&path, &serde_json::to_vec(&state)?).await
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn insert_timeseries(&self, record: &TelemetryRecord) -> StorageResult<()> {
        let dir = self.device_dir(&record.device_id)?;
        fs::create_dir_all(&dir).await?;

        let tmp = write_temp(&dir, &serde_json::to_vec(record)?).await?;
        let stem = record_file_stem(record.timestamp);

        // hard_link refuses to replace an existing file, so a taken name
        // moves on to the next suffix instead of overwriting.
        let mut suffix = 0u32;
        let linked = loop {
            let name = if suffix == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}-{}.json", stem, suffix)
            };
            match fs::hard_link(&tmp, dir.join(&name)).await {
                Ok(()) => break Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = fs::remove_file(&tmp).await {
            warn!("Failed to remove temp file {}: {}", tmp.display(), e);
        }

        linked?;
        Ok(())
    }

    async fn upsert_latest(&self, record: &TelemetryRecord) -> StorageResult<()> {
        self.write_state(record).await
    }

    async fn upsert_latest_if_newer(&self, record: &TelemetryRecord) -> StorageResult<bool> {
        let path = self.latest_path(&record.device_id)?;
        let lock = self.latest_lock(&record.device_id);
        let _guard = lock.lock().await;

        match self.read_state(&path).await {
            Ok(Some(current)) if current.last_seen > record.timestamp => {
                debug!(
                    "Keeping latest state for {} at {} (incoming {})",
                    record.device_id, current.last_seen, record.timestamp
                );
                return Ok(false);
            }
            Ok(_) => {}
            Err(StorageError::Corrupt { key, reason }) => {
                warn!("Replacing corrupt latest state {}: {}", key, reason);
            }
            Err(e) => return Err(e),
        }

        self.write_state(record).await?;
        Ok(true)
    }

    async fn query_timeseries(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<TelemetryRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let Ok(dir) = self.device_dir(device_id) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<TelemetryRecord> = self
            .read_all::<TelemetryRecord>(&dir, |_| true)
            .await?
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect();

        results.sort_by_key(|r| r.timestamp);
        Ok(results)
    }

    async fn get_latest(&self, device_id: &str) -> StorageResult<Option<TelemetryRecord>> {
        let Ok(path) = self.latest_path(device_id) else {
            return Ok(None);
        };
        Ok(self.read_state(&path).await?.map(|state| state.latest))
    }

    async fn list_devices(&self) -> StorageResult<Vec<TelemetryRecord>> {
        let mut results: Vec<TelemetryRecord> = self
            .read_all::<DeviceLatestState>(&self.latest_dir(), |stem| {
                !stem.starts_with(OTA_KEY_PREFIX)
            })
            .await?
            .into_iter()
            .map(|state| state.latest)
            .collect();

        results.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(results)
    }

    async fn set_ota_status(&self, device_id: &str, status: &OtaStatus) -> StorageResult<()> {
        check_key(device_id)?;
        let path = self.latest_path(&ota_key(device_id))?;
        write_atomic(&path, &serde_json::to_vec(status)?).await
    }

    async fn get_ota_status(&self, device_id: &str) -> StorageResult<Option<OtaStatus>> {
        if check_key(device_id).is_err() {
            return Ok(None);
        }
        let path = self.latest_path(&ota_key(device_id))?;
        match read_optional(&path).await? {
            Some(bytes) => decode_point(&path, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn skipped_rows(&self) -> u64 {
        self.skips.get()
    }
}

impl FileStore {
    /// Decodes every `*.json` file in `dir` whose stem passes `keep`.
    /// Unreadable or undecodable files are skipped and counted.
    async fn read_all<T: DeserializeOwned>(
        &self,
        dir: &Path,
        keep: impl Fn(&str) -> bool,
    ) -> StorageResult<Vec<T>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !keep(stem) {
                continue;
            }

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                    self.skips.record();
                    continue;
                }
            };
            match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!("Skipping corrupt file {}: {}", path.display(), e);
                    self.skips.record();
                }
            }
        }

        Ok(results)
    }
}

/// Keys become single path components, so separators and dot-names are refused.
fn check_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn record_file_stem(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%S%3f").to_string()
}

async fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode_point<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
        key: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Writes `bytes` to a hidden temp file in `dir` and returns its path.
async fn write_temp(dir: &Path, bytes: &[u8]) -> StorageResult<PathBuf> {
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&tmp).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(tmp)
}

/// Replaces `path` atomically via rename from a temp file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(dir).await?;

    let tmp = write_temp(dir, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
