use crate::command::DeviceCommander;
use crate::errors::Error;
use crate::model::{TelemetryRecord, TimeseriesResponse};
use crate::ota::OtaTracker;
use crate::pipeline::{BatchReport, IngestPipeline};
use crate::store::Storage;
use crate::validate::{parse_command, parse_ota_report, parse_ota_request};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Storage>,
    pipeline: IngestPipeline,
    ota: OtaTracker,
    commander: DeviceCommander,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Storage>,
        pipeline: IngestPipeline,
        ota: OtaTracker,
        commander: DeviceCommander,
    ) -> Self {
        Self {
            store,
            pipeline,
            ota,
            commander,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeseriesQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/latest", get(get_latest))
        .route("/api/devices/:id/timeseries", get(get_timeseries))
        .route(
            "/api/devices/:id/ota/status",
            get(get_ota_status).post(report_ota_status),
        )
        .route("/api/devices/:id/ota", post(request_ota))
        .route("/api/devices/:id/command", post(send_command))
        .route("/api/telemetry", post(ingest_telemetry))
        .with_state(state)
}

async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<TelemetryRecord>>, AppError> {
    Ok(Json(state.store.list_devices().await?))
}

async fn get_latest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(match state.store.get_latest(&id).await? {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn get_timeseries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TimeseriesQuery>,
) -> Result<Json<TimeseriesResponse>, AppError> {
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - Duration::hours(1));

    let data = state.store.query_timeseries(&id, from, to).await?;

    Ok(Json(TimeseriesResponse {
        device_id: id,
        from,
        to,
        total: data.len(),
        data,
    }))
}

async fn get_ota_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(match state.ota.current_status(&id).await? {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn report_ota_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let report = parse_ota_report(&body)?;
    let status = state.ota.report_status(&id, report).await?;
    Ok(Json(status).into_response())
}

async fn request_ota(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request = parse_ota_request(&body)?;
    let command = state.ota.request_update(&id, &request).await?;
    Ok(Json(json!({ "status": "ok", "otaUrl": command.url })).into_response())
}

async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let command = parse_command(&body)?;
    state.commander.send_command(&id, &command).await?;
    Ok(StatusCode::OK)
}

/// Local ingestion trigger: one request body is a one-message batch.
async fn ingest_telemetry(State(state): State<AppState>, body: Bytes) -> Json<BatchReport> {
    Json(state.pipeline.ingest_batch(vec![body.to_vec()]).await)
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(Error::Validation(msg)) = self.0.downcast_ref::<Error>() {
            return (StatusCode::BAD_REQUEST, msg.clone()).into_response();
        }

        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastSink;
    use crate::pipeline::PipelineOptions;
    use crate::store::FileStore;
    use tempfile::TempDir;

    fn state() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn Storage> = Arc::new(FileStore::new(tmp.path()));
        let sink = Arc::new(BroadcastSink::new(16));
        let pipeline = IngestPipeline::new(store.clone(), sink.clone(), PipelineOptions::default());
        let ota = OtaTracker::new(store.clone(), sink.clone());
        let commander = DeviceCommander::new(sink);
        (tmp, AppState::new(store, pipeline, ota, commander))
    }

    #[tokio::test]
    async fn test_ingest_then_read_back() {
        let (_tmp, state) = state();

        let Json(report) = ingest_telemetry(
            State(state.clone()),
            Bytes::from_static(br#"{"deviceId":"s1","sensors":[{"name":"moisture1","value":42.5}]}"#),
        )
        .await;
        assert_eq!(report.stored, 1);

        let Json(devices) = list_devices(State(state.clone())).await.ok().unwrap();
        assert_eq!(devices.len(), 1);

        let response = get_latest(State(state.clone()), Path("s1".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let Json(series) = get_timeseries(
            State(state),
            Path("s1".to_string()),
            Query(TimeseriesQuery::default()),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(series.total, 1);
        assert_eq!(series.to - series.from, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let (_tmp, state) = state();

        let latest = get_latest(State(state.clone()), Path("nope".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(latest.status(), StatusCode::NOT_FOUND);

        let ota = get_ota_status(State(state), Path("nope".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(ota.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ota_status_report_and_read() {
        let (_tmp, state) = state();

        let reported = report_ota_status(
            State(state.clone()),
            Path("s1".to_string()),
            Bytes::from_static(br#"{"version":"1.2.0","state":"downloading"}"#),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(reported.status(), StatusCode::OK);

        let read = get_ota_status(State(state), Path("s1".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_ota_bodies_are_bad_requests() {
        let (_tmp, state) = state();

        let report = report_ota_status(
            State(state.clone()),
            Path("s1".to_string()),
            Bytes::from_static(br#"{"version":"1.2.0"}"#),
        )
        .await;
        let response = report.err().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = request_ota(
            State(state),
            Path("s1".to_string()),
            Bytes::from_static(br#"{"version":"1.2.0"}"#),
        )
        .await;
        let response = request.err().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_command_route() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn Storage> = Arc::new(FileStore::new(tmp.path()));
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        let sink: Arc<dyn crate::notify::NotificationSink> = Arc::new(sink);
        let state = AppState::new(
            store.clone(),
            IngestPipeline::new(store.clone(), sink.clone(), PipelineOptions::default()),
            OtaTracker::new(store, sink.clone()),
            DeviceCommander::new(sink),
        );

        let status = send_command(
            State(state.clone()),
            Path("s1".to_string()),
            Bytes::from_static(br#"{"action":"water","seconds":30}"#),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(status, StatusCode::OK);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.scope, "device:s1");
        assert_eq!(notification.event, crate::notify::COMMAND_EVENT);
        assert_eq!(notification.payload["seconds"], 30);

        let bad = send_command(State(state), Path("s1".to_string()), Bytes::from_static(b"[]")).await;
        assert_eq!(bad.err().unwrap().into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_storage_failure_is_server_error() {
        let err = AppError::from(Error::Storage(crate::errors::StorageError::Configuration(
            "down".to_string(),
        )));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
