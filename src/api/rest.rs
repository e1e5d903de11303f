use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::api::AppState;
use crate::metrics::{metrics_route, recorder, DependencyStatus};
use crate::naming::{bare_filename, resolve_final_name, signature_base, verify, DeclaredFields};
use crate::pipeline::UploadTask;
use crate::staging::{new_request_id, staged_name, StagedFile, StagingError};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::time::Instant;
use tracing::Instrument;

/// Non-file form fields accepted per request
const MAX_FORM_FIELDS: usize = 32;

/// Staged name used while the final name is still unknown
const FALLBACK_STAGING_LABEL: &str = "upload";

pub struct RestApi {
    state: AppState,
}

impl RestApi {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/upload", post(upload))
            .route("/health", get(health_check))
            .route("/ping", get(ping))
            .route("/metrics", metrics_route())
            .with_state(self.state.clone())
    }
}

async fn ping() -> Json<JsonResponse<()>> {
    Json(JsonResponse::new(StatusCode::OK, "ok"))
}

async fn health_check(State(state): State<AppState>) -> Response {
    let (s3_storage, rabbitmq) = tokio::join!(object_store_status(&state), publisher_status(&state));
    let dependencies = Dependencies {
        s3_storage,
        rabbitmq,
    };
    let status = if dependencies.degraded() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let report = HealthReport {
        counters: state.pool.health().snapshot(),
        dependencies,
    };
    (
        status,
        Json(JsonResponse::with_data(status, "health check report", report)),
    )
        .into_response()
}

async fn object_store_status(state: &AppState) -> DependencyStatus {
    if !state.settings.enable_s3_upload {
        return DependencyStatus::NotConfigured;
    }
    match &state.object_store {
        Some(store) => match store.health_check().await {
            Ok(()) => DependencyStatus::Ok,
            Err(e) => DependencyStatus::Error(e.to_string()),
        },
        None => DependencyStatus::Error("object storage not configured".into()),
    }
}

async fn publisher_status(state: &AppState) -> DependencyStatus {
    if !state.settings.enable_rabbitmq {
        return DependencyStatus::NotConfigured;
    }
    match &state.publisher {
        Some(publisher) => match publisher.health_check().await {
            Ok(()) => DependencyStatus::Ok,
            Err(e) => DependencyStatus::Error(e.to_string()),
        },
        None => DependencyStatus::Error("rabbitmq not configured".into()),
    }
}

/// `POST /upload`
///
/// Responds as soon as the body is staged and the task is queued. The
/// response says nothing about whether delivery will succeed.
async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = new_request_id();
    let span = tracing::info_span!("upload", request_id = %request_id);

    async move {
        let arrival = Utc::now();
        let started = Instant::now();
        let _active = state.pool.health().begin_upload();
        recorder::record_upload_received();

        let result = ingest(&state, &request_id, started, multipart).await;
        if let Err(e) = &result {
            e.record(state.pool.health());
            tracing::warn!(error = %e, "Upload rejected");
        }

        tracing::info!(
            arrival_time = %arrival.to_rfc3339(),
            completion_time = %Utc::now().to_rfc3339(),
            duration = ?started.elapsed(),
            result = if result.is_ok() { "ack" } else { "nak" },
            "POST request summary"
        );

        match result {
            Ok(name) => Json(JsonResponse::with_data(
                StatusCode::OK,
                "File upload success",
                name,
            ))
            .into_response(),
            Err(e) => e.into_response(),
        }
    }
    .instrument(span)
    .await
}

/// Stage the body, name and verify it, and hand it to the pool.
///
/// Returns the name the artifact will be delivered under.
async fn ingest(
    state: &AppState,
    request_id: &str,
    started: Instant,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<String> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!(error = %e, "Request is not multipart");
        ApiError::NotMultipart
    })?;
    let reservation = state
        .pool
        .reserve(request_id)
        .ok_or_else(|| ApiError::Internal(format!("request id {request_id} already in use")))?;
    let settings = &state.settings;

    let mut fields = DeclaredFields::default();
    let mut staged: Option<StagedFile> = None;
    let mut original_filename = String::new();
    let mut content_type: Option<String> = None;
    let mut field_count = 0usize;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if staged.is_some() => {
                tracing::warn!(
                    error = %e,
                    "Error reading next part, but file was already received. Proceeding."
                );
                break;
            }
            Err(e) => return Err(ApiError::ReadStream(e.to_string())),
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            if staged.is_some() {
                tracing::warn!("Ignoring additional file part");
                continue;
            }
            original_filename = field.file_name().unwrap_or_default().to_string();
            content_type = field.content_type().map(str::to_string);

            let label = staging_label(&original_filename);
            let file = state
                .stager
                .stage(&settings.staging_dir, &label, request_id, field)
                .await?;
            state.pool.health().record_camera_send(started.elapsed());
            staged = Some(file);
            continue;
        }

        field_count += 1;
        if field_count > MAX_FORM_FIELDS {
            return Err(ApiError::TooManyFields);
        }
        match field.text().await {
            Ok(value) => {
                if !fields.set(&name, value) {
                    tracing::debug!(field = %name, "Ignoring unknown form field");
                }
            }
            Err(e) => tracing::warn!(field = %name, error = %e, "Error reading form field"),
        }
    }

    let mut staged = staged.ok_or(ApiError::MissingFile)?;

    let resolved = resolve_final_name(&fields, &original_filename, content_type.as_deref())?;
    if let Some(e) = &resolved.build_error {
        tracing::info!(build_error = %e, "Standard filename not built, using original name");
    }

    if settings.enable_secret {
        let base = signature_base(&fields.filename, &resolved.name);
        if !verify(&fields.sign, base, &fields.timestamp, &settings.secret_key) {
            tracing::warn!(
                received_sign = %fields.sign,
                base_for_sign = %base,
                timestamp = %fields.timestamp,
                "Invalid signature"
            );
            return Err(ApiError::SignatureMismatch);
        }
    }

    staged
        .rename(settings.staging_dir.join(staged_name(&resolved.name, request_id)))
        .await
        .map_err(StagingError::from)?;
    let size = staged.bytes();
    let staging_path = staged.keep();

    let delivered = state.pool.pipeline().expected_delivery_name(&resolved.name);
    let task = UploadTask::new(
        request_id,
        original_filename.as_str(),
        resolved.name.as_str(),
        staging_path,
        size,
        settings.mode,
        settings.final_directory.clone(),
    );

    recorder::record_upload_accepted(size);
    tracing::info!(
        original_filename = %original_filename,
        final_filename = %resolved.name,
        provided_filename = %fields.filename,
        size,
        "Upload staged, queued for processing"
    );
    // Detached; the task reports its own outcome
    drop(state.pool.submit(reservation, task));

    Ok(delivered)
}

/// Bare form of the sender's filename, safe to stage under
fn staging_label(original_filename: &str) -> String {
    bare_filename(original_filename).unwrap_or_else(|_| FALLBACK_STAGING_LABEL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::IngestSettings;
    use crate::events::{EventPublisher, PublishError, PublishResult, UploadEvent};
    use crate::metrics::HealthState;
    use crate::naming::sign;
    use crate::pipeline::{PipelineSettings, ProcessingPipeline, TaskMode};
    use crate::pool::WorkerPool;
    use crate::staging::StreamStager;
    use crate::storage::{ObjectStore, StorageError, StorageResult};
    use crate::transcoder::{RemuxStrategy, TranscodeError, TranscodeResult, Transcoder};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::Service;

    const SECRET: &str = "test-secret";
    const BOUNDARY: &str = "dvr-test-boundary";

    struct CopyTranscoder;

    #[async_trait]
    impl Transcoder for CopyTranscoder {
        async fn remux(&self, input: &Path, output: &Path, _: RemuxStrategy) -> TranscodeResult<()> {
            tokio::fs::copy(input, output).await.unwrap();
            Ok(())
        }

        async fn compress(&self, _: &Path, _: &Path) -> TranscodeResult<()> {
            Err(TranscodeError::NoVideoStream)
        }
    }

    struct DownStore;

    #[async_trait]
    impl ObjectStore for DownStore {
        async fn put(&self, _: &Path, _: &str, _: &str) -> StorageResult<()> {
            Err(StorageError::Request("unreachable".into()))
        }

        async fn health_check(&self) -> StorageResult<()> {
            Err(StorageError::Request("connection refused".into()))
        }
    }

    struct DownPublisher;

    #[async_trait]
    impl EventPublisher for DownPublisher {
        async fn publish(&self, _: &UploadEvent) -> PublishResult<()> {
            Err(PublishError::Publish("down".into()))
        }

        async fn health_check(&self) -> PublishResult<()> {
            Err(PublishError::Publish("down".into()))
        }
    }

    struct TestApp {
        _temp: TempDir,
        staging: PathBuf,
        visible: PathBuf,
        state: AppState,
    }

    fn test_app(enable_s3_upload: bool, object_store: Option<Arc<dyn ObjectStore>>) -> TestApp {
        test_app_with(enable_s3_upload, object_store, false)
    }

    fn test_app_with(
        enable_s3_upload: bool,
        object_store: Option<Arc<dyn ObjectStore>>,
        enable_rabbitmq: bool,
    ) -> TestApp {
        let temp = TempDir::new().unwrap();
        let visible = temp.path().join("upload");
        let staging = temp.path().join(".processing_upload");

        let pipeline = ProcessingPipeline::new(
            PipelineSettings {
                enable_upload: false,
                enable_publish: false,
                ..Default::default()
            },
            Arc::new(CopyTranscoder),
            None,
            None,
            Arc::new(HealthState::new()),
        );
        let state = AppState {
            settings: Arc::new(IngestSettings {
                secret_key: SECRET.into(),
                enable_secret: true,
                staging_dir: staging.clone(),
                final_directory: Some(visible.clone()),
                mode: TaskMode {
                    local_storage: true,
                    disaster_recovery: false,
                },
                enable_s3_upload,
                enable_rabbitmq,
                max_upload_bytes: 1 << 20,
            }),
            stager: StreamStager::new(),
            pool: WorkerPool::new(Arc::new(pipeline), 2),
            object_store,
            publisher: None,
        };

        TestApp {
            _temp: temp,
            staging,
            visible,
            state,
        }
    }

    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((filename, data)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let mut router = RestApi::new(app.state.clone()).router();
        let response = router.call(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn wait_for(path: &Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never appeared", path.display());
    }

    fn staging_count(app: &TestApp) -> usize {
        std::fs::read_dir(&app.staging)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_ping() {
        let app = test_app(false, None);
        let request = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "ok");
    }

    #[tokio::test]
    async fn test_health_ok_when_collaborators_switched_off() {
        let app = test_app(false, None);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "health check report");
        assert_eq!(body["data"]["status"], "running");
        assert_eq!(body["data"]["dependencies"]["s3_storage"], "not_configured");
        assert_eq!(body["data"]["dependencies"]["rabbitmq"], "not_configured");
        assert!(body["data"]["metrics"]["avg_camera_send_time"].is_string());
    }

    #[tokio::test]
    async fn test_health_unavailable_when_store_down() {
        let app = test_app(true, Some(Arc::new(DownStore)));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 503);
        assert_eq!(
            body["data"]["dependencies"]["s3_storage"],
            "error: Request failed: connection refused"
        );
    }

    #[tokio::test]
    async fn test_health_unavailable_when_publisher_down() {
        let mut app = test_app_with(false, None, true);
        app.state.publisher = Some(Arc::new(DownPublisher));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_multipart() {
        let app = test_app(false, None);
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert_eq!(body["message"], "Expected multipart/form-data");
    }

    #[tokio::test]
    async fn test_upload_requires_file() {
        let app = test_app(false, None);
        let (status, body) = send(&app, upload_request(multipart_body(&[("imei", "1")], None))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "File is required");
        assert_eq!(app.state.pool.health().failed_uploads(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_leaves_nothing_staged() {
        let app = test_app(false, None);
        let body = multipart_body(
            &[("timestamp", "1700000000"), ("sign", "bogus")],
            Some(("clip.jpg", b"jpeg-bytes")),
        );
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert_eq!(body["message"], "Signature error");
        assert_eq!(staging_count(&app), 0);
        assert_eq!(app.state.pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_upload_is_named_and_finalized() {
        let app = test_app(false, None);
        let expected = "864993060014264_AABB_1_03.jpg";
        let timestamp = "1700000000";
        let body = multipart_body(
            &[
                ("imei", "864993060014264"),
                ("raw", "AABB"),
                ("channel", "1"),
                ("index", "3"),
                ("timestamp", timestamp),
                ("sign", &sign(expected, timestamp, SECRET)),
            ],
            Some(("snap.jpg", b"jpeg-bytes")),
        );
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "File upload success");
        assert_eq!(body["data"], expected);

        wait_for(&app.visible.join(expected)).await;
        assert_eq!(std::fs::read(app.visible.join(expected)).unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_ts_upload_reports_mp4_name() {
        let app = test_app(false, None);
        let timestamp = "1700000000";
        let body = multipart_body(
            &[
                ("filename", "clip.ts"),
                ("timestamp", timestamp),
                ("sign", &sign("clip.ts", timestamp, SECRET)),
            ],
            Some(("whatever.ts", b"transport-stream")),
        );
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "clip.mp4");

        wait_for(&app.visible.join("clip.mp4")).await;
        for _ in 0..200 {
            if staging_count(&app) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(staging_count(&app), 0);
    }

    #[tokio::test]
    async fn test_overlong_override_rejected() {
        let app = test_app(false, None);
        let long_name = format!("{}.mp4", "a".repeat(300));
        let body = multipart_body(&[("filename", &long_name)], Some(("clip.mp4", b"data")));
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "File name too long");
        assert_eq!(staging_count(&app), 0);
    }

    #[tokio::test]
    async fn test_long_original_name_with_short_override_accepted() {
        let app = test_app(false, None);
        let original = format!("{}.jpg", "o".repeat(240));
        let timestamp = "1700000000";
        let body = multipart_body(
            &[
                ("filename", "short.jpg"),
                ("timestamp", timestamp),
                ("sign", &sign("short.jpg", timestamp, SECRET)),
            ],
            Some((original.as_str(), b"jpeg-bytes")),
        );
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["data"], "short.jpg");
        wait_for(&app.visible.join("short.jpg")).await;
    }

    #[tokio::test]
    async fn test_long_override_within_limit_delivered_under_full_name() {
        let app = test_app(false, None);
        let long_name = format!("{}.jpg", "n".repeat(226));
        assert_eq!(long_name.len(), 230);
        let timestamp = "1700000000";
        let body = multipart_body(
            &[
                ("filename", &long_name),
                ("timestamp", timestamp),
                ("sign", &sign(&long_name, timestamp, SECRET)),
            ],
            Some(("clip.jpg", b"jpeg-bytes")),
        );
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::OK, "body: {body}");
        assert_eq!(body["data"], long_name.as_str());
        wait_for(&app.visible.join(&long_name)).await;
        assert_eq!(std::fs::read(app.visible.join(&long_name)).unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_health_unavailable_when_publisher_enabled_but_missing() {
        let app = test_app_with(false, None, true);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body["data"]["dependencies"]["rabbitmq"],
            "error: rabbitmq not configured"
        );
        assert_eq!(body["data"]["dependencies"]["s3_storage"], "not_configured");
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let app = test_app(false, None);
        let body = multipart_body(&[], Some(("clip.mp4", b"")));
        let (status, body) = send(&app, upload_request(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "File is empty");
        assert_eq!(staging_count(&app), 0);
    }

    #[test]
    fn test_staging_label() {
        assert_eq!(staging_label("dir/clip.ts"), "clip.ts");
        assert_eq!(staging_label(""), FALLBACK_STAGING_LABEL);
        assert_eq!(staging_label(&"x".repeat(400)), FALLBACK_STAGING_LABEL);
    }
}
