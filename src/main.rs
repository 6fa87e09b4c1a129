// HTTP entry point for the park image analysis service

use parklens::{
    core::{
        types::{
            AnalysisArtifact, AnalyzeParams, BatchResult, Envelope, ImageRecord, NatureParams,
            RenderRequest, ResultKind, SimilarImage,
        },
        Config,
    },
    orchestration::{BatchOrchestrator, CancelToken, Coordinator},
    storage::{BlobStore, ContentStore, MemoryBlobStore, RemoteBlobStore},
    utils::Metrics,
    vision::VisionClient,
    ApiError, ResultCache,
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
    orchestrator: Arc<BatchOrchestrator>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().expect("Failed to load configuration"));

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let level_str = match config.server.log_level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    };
    let filter = EnvFilter::new(format!(
        "{},h2=warn,tower_http=warn,hyper=warn,reqwest=warn",
        level_str
    ));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("=== PARKLENS IMAGE ANALYSIS SERVICE ===");

    let metrics = Metrics::new();

    let blobs: Arc<dyn BlobStore> = match config.storage.mode.as_str() {
        "remote" => Arc::new(RemoteBlobStore::new(&config.storage, &config.retry)?),
        _ => Arc::new(MemoryBlobStore::new()),
    };
    info!("blob store mode: {}", config.storage.mode);

    let content = Arc::new(ContentStore::new(config.storage.clone(), Arc::clone(&blobs)).await?);
    info!("content store: {} records", content.record_count());

    let vision = Arc::new(VisionClient::new(
        &config.vision,
        &config.retry,
        Some(metrics.clone()),
    )?);

    let cache = Arc::new(ResultCache::new(config.cache.clone()));
    cache.sync_versions().await;

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        content,
        blobs,
        vision,
        Arc::clone(&cache),
        metrics.clone(),
    ));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        Arc::clone(&coordinator),
        config.batch.clone(),
    ));

    let state = AppState {
        config: Arc::clone(&config),
        coordinator,
        orchestrator,
        metrics,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/images", post(upload_image).get(list_images))
        .route(
            "/api/v1/images/:image_hash",
            get(image_info).delete(delete_image),
        )
        .route("/api/v1/images/:image_hash/duplicate", get(check_duplicate))
        .route("/api/v1/analysis/analyze", post(analyze))
        .route("/api/v1/analysis/nature", post(analyze_nature))
        .route("/api/v1/analysis/annotated", post(download_annotated))
        .route("/api/v1/analysis/batch", post(batch_analyze))
        .route("/api/v1/admin/invalidate/:kind", post(invalidate_version))
        .route("/api/v1/admin/stats", get(stats_endpoint))
        .route("/api/v1/admin/cache/clear", post(clear_cache))
        .route("/api/v1/admin/cache/cleanup", post(cleanup_cache))
        .route("/api/v1/admin/warm", post(warm_cache))
        .with_state(state)
        .layer(DefaultBodyLimit::max(
            config.storage.max_upload_bytes as usize + 1024 * 1024,
        ))
        .layer(cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("{}", "=".repeat(60));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(60));
    info!("Endpoints:");
    info!("  GET    /health                        - Health check");
    info!("  GET    /metrics                       - Prometheus metrics");
    info!("  POST   /api/v1/images                 - Upload image");
    info!("  GET    /api/v1/images                 - List images");
    info!("  GET    /api/v1/images/:hash           - Image info");
    info!("  DELETE /api/v1/images/:hash           - Delete image");
    info!("  GET    /api/v1/images/:hash/duplicate - Duplicate check");
    info!("  POST   /api/v1/analysis/analyze       - Object/face analysis");
    info!("  POST   /api/v1/analysis/nature        - Natural-element analysis");
    info!("  POST   /api/v1/analysis/annotated     - Annotated download");
    info!("  POST   /api/v1/analysis/batch         - Batch analysis");
    info!("  POST   /api/v1/admin/invalidate/:kind - Version bump");
    info!("  GET    /api/v1/admin/stats            - Service statistics");
    info!("  POST   /api/v1/admin/cache/clear      - Clear cache entries");
    info!("{}", "=".repeat(60));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "IMAGE_NOT_FOUND" | "RESOURCE_NOT_FOUND" => StatusCode::NOT_FOUND,
        "RATE_LIMIT_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "VISION_SERVICE_ERROR" | "STORAGE_ERROR" => StatusCode::BAD_GATEWAY,
        "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn envelope_response<T: serde::Serialize>(envelope: Envelope<T>) -> impl IntoResponse {
    let status = match &envelope.error {
        Some(error) => status_for(&error.code),
        None => StatusCode::OK,
    };
    (status, Json(envelope))
}

async fn root() -> &'static str {
    "Park Image Analysis Service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (records, bytes) = state.coordinator.storage_stats();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "storage_mode": state.config.storage.mode,
        "images": records,
        "stored_bytes": bytes,
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

#[derive(serde::Serialize)]
struct UploadResponse {
    image_hash: String,
    perceptual_hash: String,
    status: parklens::core::types::IngestStatus,
    is_duplicate: bool,
    similar_images: Vec<SimilarImage>,
    record: ImageRecord,
}

async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("upload");
    let started = Instant::now();

    let mut payload: Option<(Vec<u8>, String, String)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        if name == "image" || name == "file" {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let mime = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_else(|| mime_from_filename(&filename));
            match field.bytes().await {
                Ok(bytes) => payload = Some((bytes.to_vec(), filename, mime)),
                Err(e) => {
                    let err = ApiError::validation(format!("multipart read error: {e}"));
                    return envelope_response(Envelope::<UploadResponse>::err(
                        &err,
                        started.elapsed().as_millis() as u64,
                    ));
                }
            }
        }
    }

    let Some((bytes, filename, mime)) = payload else {
        let err = ApiError::validation("no image field in multipart body");
        return envelope_response(Envelope::<UploadResponse>::err(
            &err,
            started.elapsed().as_millis() as u64,
        ));
    };

    let result = state
        .coordinator
        .upload(bytes, &filename, &mime)
        .await
        .map(|ingest| {
            (
                UploadResponse {
                    image_hash: ingest.record.image_hash.clone(),
                    perceptual_hash: ingest.record.perceptual_hash.clone(),
                    status: ingest.status,
                    is_duplicate: ingest.is_duplicate,
                    similar_images: ingest.similar_images,
                    record: ingest.record,
                },
                false,
            )
        });
    envelope_response(Coordinator::envelope(result, started))
}

fn mime_from_filename(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    mime_type: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("list_images");
    let (page, total) =
        state
            .coordinator
            .list_images(query.offset, query.limit, query.mime_type.as_deref());
    Json(serde_json::json!({
        "total": total,
        "offset": query.offset,
        "count": page.len(),
        "images": page,
    }))
}

async fn image_info(
    State(state): State<AppState>,
    Path(image_hash): Path<String>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("image_info");
    let started = Instant::now();
    let result = state
        .coordinator
        .image_info(&image_hash)
        .map(|record| (record, false));
    envelope_response(Coordinator::envelope(result, started))
}

async fn delete_image(
    State(state): State<AppState>,
    Path(image_hash): Path<String>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("delete_image");
    let started = Instant::now();
    let result = state
        .coordinator
        .delete_image(&image_hash)
        .await
        .map(|cleared| {
            (
                serde_json::json!({"deleted": image_hash, "cache_entries_cleared": cleared}),
                false,
            )
        });
    envelope_response(Coordinator::envelope(result, started))
}

async fn check_duplicate(
    State(state): State<AppState>,
    Path(image_hash): Path<String>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("check_duplicate");
    let started = Instant::now();
    let result = state
        .coordinator
        .check_duplicate(&image_hash)
        .map(|(is_duplicate, similar)| {
            (
                serde_json::json!({
                    "is_duplicate": is_duplicate,
                    "exact_matches": [image_hash],
                    "similar_images": similar,
                }),
                false,
            )
        });
    envelope_response(Coordinator::envelope(result, started))
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    image_hash: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    params: AnalyzeParams,
    #[serde(default)]
    force_refresh: bool,
}

fn default_kind() -> String {
    "detect".to_string()
}

async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("analyze");
    let started = Instant::now();

    let Some(kind) = ResultKind::parse(&request.kind) else {
        let err = ApiError::validation(format!("unknown analysis kind: {}", request.kind));
        return envelope_response(Envelope::<AnalysisArtifact>::err(
            &err,
            started.elapsed().as_millis() as u64,
        ));
    };

    let result = with_deadline(
        &state,
        "analyze",
        state
            .coordinator
            .analyze(&request.image_hash, kind, &request.params, request.force_refresh),
    )
    .await
    .map(|(artifact, from_cache)| ((*artifact).clone(), from_cache));
    envelope_response(Coordinator::envelope(result, started))
}

/// Per-request end-to-end deadline. A timed-out computation is abandoned
/// here; the cache is only populated by computations that finish.
async fn with_deadline<T>(
    state: &AppState,
    operation: &str,
    future: impl std::future::Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    match tokio::time::timeout(state.config.server.request_timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::timeout(operation)),
    }
}

#[derive(Deserialize)]
struct NatureRequest {
    image_hash: String,
    #[serde(flatten)]
    params: NatureParams,
    #[serde(default)]
    force_refresh: bool,
}

async fn analyze_nature(
    State(state): State<AppState>,
    Json(request): Json<NatureRequest>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("analyze_nature");
    let started = Instant::now();
    let result = with_deadline(
        &state,
        "analyze_nature",
        state
            .coordinator
            .analyze_nature(&request.image_hash, &request.params, request.force_refresh),
    )
    .await
    .map(|(artifact, from_cache)| ((*artifact).clone(), from_cache));
    envelope_response(Coordinator::envelope(result, started))
}

#[derive(Deserialize)]
struct AnnotatedRequest {
    image_hash: String,
    #[serde(default)]
    render_request: RenderRequest,
}

async fn download_annotated(
    State(state): State<AppState>,
    Json(request): Json<AnnotatedRequest>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("download_annotated");
    let started = Instant::now();
    let result = with_deadline(
        &state,
        "download_annotated",
        state
            .coordinator
            .download_annotated(&request.image_hash, &request.render_request),
    )
    .await
    .map(|(artifact, from_cache)| ((*artifact).clone(), from_cache));
    envelope_response(Coordinator::envelope(result, started))
}

#[derive(Deserialize)]
struct BatchRequest {
    image_hashes: Vec<String>,
    kinds: Vec<String>,
    #[serde(default)]
    params: serde_json::Value,
    concurrency_limit: Option<usize>,
}

async fn batch_analyze(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("batch_analyze");
    let started = Instant::now();

    if request.image_hashes.is_empty() || request.kinds.is_empty() {
        let err = ApiError::validation("image_hashes and kinds must be non-empty");
        return envelope_response(Envelope::<BatchResult>::err(
            &err,
            started.elapsed().as_millis() as u64,
        ));
    }

    let mut kinds = Vec::with_capacity(request.kinds.len());
    for raw in &request.kinds {
        match ResultKind::parse(raw) {
            Some(kind) => kinds.push(kind),
            None => {
                let err = ApiError::validation(format!("unknown analysis kind: {raw}"));
                return envelope_response(Envelope::<BatchResult>::err(
                    &err,
                    started.elapsed().as_millis() as u64,
                ));
            }
        }
    }

    let params = if request.params.is_null() {
        serde_json::json!({})
    } else {
        request.params
    };

    let result = state
        .orchestrator
        .batch_analyze(
            &request.image_hashes,
            &kinds,
            params,
            request.concurrency_limit,
            CancelToken::new(),
        )
        .await;
    envelope_response(Coordinator::envelope(Ok((result, false)), started))
}

async fn invalidate_version(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("invalidate_version");
    let started = Instant::now();

    let Some(kind) = ResultKind::parse(&kind) else {
        let err = ApiError::validation(format!("unknown analysis kind: {kind}"));
        return envelope_response(Envelope::<serde_json::Value>::err(
            &err,
            started.elapsed().as_millis() as u64,
        ));
    };

    let version = state.coordinator.invalidate_version(kind).await;
    envelope_response(Coordinator::envelope(
        Ok((
            serde_json::json!({"kind": kind.prefix(), "version": version}),
            false,
        )),
        started,
    ))
}

async fn stats_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("stats");
    let (records, bytes) = state.coordinator.storage_stats();
    Json(serde_json::json!({
        "cache": state.coordinator.cache().stats(),
        "storage": {"images": records, "bytes": bytes},
        "service": state.metrics.snapshot(),
    }))
}

#[derive(Deserialize, Default)]
struct ClearCacheRequest {
    image_hash: Option<String>,
}

async fn clear_cache(
    State(state): State<AppState>,
    body: Option<Json<ClearCacheRequest>>,
) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("clear_cache");
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let cleared = state
        .coordinator
        .clear_cache(request.image_hash.as_deref())
        .await;
    Json(serde_json::json!({"cleared": cleared}))
}

async fn cleanup_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("cleanup_cache");
    let purged = state.coordinator.cache().cleanup();
    Json(serde_json::json!({"purged": purged}))
}

#[derive(Deserialize)]
struct WarmRequest {
    image_hashes: Vec<String>,
    kinds: Vec<String>,
}

async fn warm_cache(
    State(state): State<AppState>,
    Json(request): Json<WarmRequest>,
) -> impl IntoResponse {
    state.metrics.record_endpoint_request("warm_cache");
    let started = Instant::now();

    let kinds: Vec<ResultKind> = request
        .kinds
        .iter()
        .filter_map(|k| ResultKind::parse(k))
        .collect();
    let warmed = state.coordinator.warm(&request.image_hashes, &kinds).await;
    envelope_response(Coordinator::envelope(
        Ok((serde_json::json!({"warmed": warmed}), false)),
        started,
    ))
}
