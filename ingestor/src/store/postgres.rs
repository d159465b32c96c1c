//! Durable backend on PostgreSQL, used as a partitioned document store.
//!
//! Both collections are hash-partitioned on `device_id`, so every read and
//! write for one device touches a single partition. Only `list_devices`
//! scans across partitions.

use super::{ota_key, SkipCounter, Storage, StorageResult};
use crate::errors::StorageError;
use crate::model::{DeviceLatestState, OtaStatus, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub timeseries_table: String,
    pub latest_table: String,
    pub partitions: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            timeseries_table: "device_timeseries".to_string(),
            latest_table: "devices_latest".to_string(),
            partitions: 8,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Body of a latest-state document: `{id, deviceId, lastSeen, latest}`.
#[derive(Debug, Serialize, Deserialize)]
struct LatestDocument {
    id: String,
    #[serde(flatten)]
    state: DeviceLatestState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtaDocument {
    id: String,
    device_id: String,
    status: OtaStatus,
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    doc: Value,
}

struct Statements {
    insert_timeseries: String,
    query_timeseries: String,
    upsert_latest: String,
    upsert_latest_if_newer: String,
    get_document: String,
    list_latest: String,
}

impl Statements {
    fn new(timeseries: &str, latest: &str) -> Self {
        let upsert = format!(
            "INSERT INTO {latest} (id, device_id, last_seen, doc) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (device_id, id) DO UPDATE SET last_seen = EXCLUDED.last_seen, doc = EXCLUDED.doc"
        );
        Self {
            insert_timeseries: format!(
                "INSERT INTO {timeseries} (id, device_id, ts, doc) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (device_id, id) DO NOTHING"
            ),
            query_timeseries: format!(
                "SELECT doc FROM {timeseries} WHERE device_id = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts"
            ),
            upsert_latest_if_newer: format!("{upsert} WHERE {latest}.last_seen <= EXCLUDED.last_seen"),
            upsert_latest: upsert,
            get_document: format!("SELECT doc FROM {latest} WHERE device_id = $1 AND id = $2"),
            list_latest: format!("SELECT doc FROM {latest} WHERE id = device_id ORDER BY device_id"),
        }
    }
}

pub struct PgStore {
    pool: PgPool,
    statements: Statements,
    skips: SkipCounter,
}

impl PgStore {
    /// Connects and ensures both collections exist. Any failure here is a
    /// configuration error: the process cannot run without its store.
    pub async fn connect(database_url: &str, options: PgStoreOptions) -> StorageResult<Self> {
        validate_identifier(&options.timeseries_table)?;
        validate_identifier(&options.latest_table)?;
        if options.partitions == 0 {
            return Err(StorageError::Configuration(
                "partition count must be at least 1".to_string(),
            ));
        }

        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| {
                StorageError::Configuration(format!("failed to connect to database: {}", e))
            })?;
        info!("Database connection established");

        for statement in collection_ddl(
            &options.timeseries_table,
            &options.latest_table,
            options.partitions,
        ) {
            sqlx::query(&statement).execute(&pool).await.map_err(|e| {
                StorageError::Configuration(format!("failed to ensure collections: {}", e))
            })?;
        }
        info!(
            "Collections {} and {} ready ({} partitions)",
            options.timeseries_table, options.latest_table, options.partitions
        );

        Ok(Self {
            pool,
            statements: Statements::new(&options.timeseries_table, &options.latest_table),
            skips: SkipCounter::new("postgres"),
        })
    }

    async fn upsert_document(
        &self,
        statement: &str,
        id: &str,
        device_id: &str,
        last_seen: DateTime<Utc>,
        doc: Value,
    ) -> StorageResult<u64> {
        let result = sqlx::query(statement)
            .bind(id)
            .bind(device_id)
            .bind(last_seen)
            .bind(doc)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_document(&self, device_id: &str, id: &str) -> StorageResult<Option<Value>> {
        let row = sqlx::query_as::<_, DocumentRow>(&self.statements.get_document)
            .bind(device_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.doc))
    }

    fn latest_upsert_args(record: &TelemetryRecord) -> StorageResult<Value> {
        let doc = LatestDocument {
            id: record.device_id.clone(),
            state: DeviceLatestState::from(record.clone()),
        };
        Ok(serde_json::to_value(doc)?)
    }
}

#[async_trait]
impl Storage for PgStore {
    async fn insert_timeseries(&self, record: &TelemetryRecord) -> StorageResult<()> {
        let doc = serde_json::to_value(record)?;
        let base_id = document_id(record);

        // A taken id moves on to the next suffix, so a re-delivered message
        // becomes a second record instead of an error or an overwrite.
        let mut suffix = 0u32;
        loop {
            let id = suffixed_id(&base_id, suffix);
            let inserted = sqlx::query(&self.statements.insert_timeseries)
                .bind(&id)
                .bind(&record.device_id)
                .bind(record.timestamp)
                .bind(&doc)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if inserted > 0 {
                return Ok(());
            }
            debug!("Time series id {} taken, trying next suffix", id);
            suffix += 1;
        }
    }

    async fn upsert_latest(&self, record: &TelemetryRecord) -> StorageResult<()> {
        let doc = Self::latest_upsert_args(record)?;
        self.upsert_document(
            &self.statements.upsert_latest,
            &record.device_id,
            &record.device_id,
            record.timestamp,
            doc,
        )
        .await?;
        Ok(())
    }

    async fn upsert_latest_if_newer(&self, record: &TelemetryRecord) -> StorageResult<bool> {
        let doc = Self::latest_upsert_args(record)?;
        let applied = self
            .upsert_document(
                &self.statements.upsert_latest_if_newer,
                &record.device_id,
                &record.device_id,
                record.timestamp,
                doc,
            )
            .await?;
        Ok(applied > 0)
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

        // The ts column holds microseconds; widen the lower bound to match and
        // apply the exact interval to the decoded records.
        let rows = sqlx::query_as::<_, DocumentRow>(&self.statements.query_timeseries)
            .bind(device_id)
            .bind(from.trunc_subsecs(6))
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut results: Vec<TelemetryRecord> = rows
            .into_iter()
            .filter_map(|row| match map_timeseries_row(row.doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable time series row for {}: {}", device_id, e);
                    self.skips.record();
                    None
                }
            })
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect();

        results.sort_by_key(|r| r.timestamp);
        Ok(results)
    }

    async fn get_latest(&self, device_id: &str) -> StorageResult<Option<TelemetryRecord>> {
        match self.fetch_document(device_id, device_id).await? {
            Some(doc) => map_latest_row(doc)
                .map(Some)
                .map_err(|e| corrupt(device_id, e)),
            None => Ok(None),
        }
    }

    async fn list_devices(&self) -> StorageResult<Vec<TelemetryRecord>> {
        let rows = sqlx::query_as::<_, DocumentRow>(&self.statements.list_latest)
            .fetch_all(&self.pool)
            .await?;

        let mut results: Vec<TelemetryRecord> = rows
            .into_iter()
            .filter_map(|row| match map_latest_row(row.doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable latest-state row: {}", e);
                    self.skips.record();
                    None
                }
            })
            .collect();

        results.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(results)
    }

    async fn set_ota_status(&self, device_id: &str, status: &OtaStatus) -> StorageResult<()> {
        let id = ota_key(device_id);
        let doc = serde_json::to_value(OtaDocument {
            id: id.clone(),
            device_id: device_id.to_string(),
            status: status.clone(),
        })?;
        self.upsert_document(
            &self.statements.upsert_latest,
            &id,
            device_id,
            status.timestamp,
            doc,
        )
        .await?;
        Ok(())
    }

    async fn get_ota_status(&self, device_id: &str) -> StorageResult<Option<OtaStatus>> {
        let id = ota_key(device_id);
        match self.fetch_document(device_id, &id).await? {
            Some(doc) => map_ota_row(doc).map(Some).map_err(|e| corrupt(&id, e)),
            None => Ok(None),
        }
    }

    fn skipped_rows(&self) -> u64 {
        self.skips.get()
    }
}

/// Time series document id: `deviceId-<RFC 3339 timestamp>`.
pub fn document_id(record: &TelemetryRecord) -> String {
    format!(
        "{}-{}",
        record.device_id,
        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

fn suffixed_id(base_id: &str, suffix: u32) -> String {
    if suffix == 0 {
        base_id.to_string()
    } else {
        format!("{}-{}", base_id, suffix)
    }
}

fn map_timeseries_row(doc: Value) -> Result<TelemetryRecord, serde_json::Error> {
    serde_json::from_value(doc)
}

fn map_latest_row(doc: Value) -> Result<TelemetryRecord, serde_json::Error> {
    serde_json::from_value::<LatestDocument>(doc).map(|d| d.state.latest)
}

fn map_ota_row(doc: Value) -> Result<OtaStatus, serde_json::Error> {
    serde_json::from_value::<OtaDocument>(doc).map(|d| d.status)
}

fn corrupt(key: &str, e: serde_json::Error) -> StorageError {
    StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

/// Table names are interpolated into SQL, so only plain lowercase
/// identifiers short enough to take a partition suffix are accepted.
fn validate_identifier(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && name.len() <= 40 {
        Ok(())
    } else {
        Err(StorageError::Configuration(format!(
            "invalid table name {:?}",
            name
        )))
    }
}

fn collection_ddl(timeseries: &str, latest: &str, partitions: u32) -> Vec<String> {
    let mut ddl = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {timeseries} (\
             id TEXT NOT NULL, device_id TEXT NOT NULL, ts TIMESTAMPTZ NOT NULL, doc JSONB NOT NULL, \
             PRIMARY KEY (device_id, id)) PARTITION BY HASH (device_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {latest} (\
             id TEXT NOT NULL, device_id TEXT NOT NULL, last_seen TIMESTAMPTZ NOT NULL, doc JSONB NOT NULL, \
             PRIMARY KEY (device_id, id)) PARTITION BY HASH (device_id)"
        ),
    ];

    for table in [timeseries, latest] {
        for remainder in 0..partitions {
            ddl.push(format!(
                "CREATE TABLE IF NOT EXISTS {table}_p{remainder} PARTITION OF {table} \
                 FOR VALUES WITH (MODULUS {partitions}, REMAINDER {remainder})"
            ));
        }
    }

    ddl.push(format!(
        "CREATE INDEX IF NOT EXISTS {timeseries}_device_ts_idx ON {timeseries} (device_id, ts)"
    ));
    ddl
}

/// Connection-class failures that a later attempt could get past.
pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
