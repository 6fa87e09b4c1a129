// Request coordinator
//
// The per-request facade: validate, resolve the image, build the cache
// fingerprint, run GetOrCompute, assemble the envelope. This is the only
// layer that converts ApiError into response envelopes; services below it
// never shape responses. All collaborators are injected at construction,
// so there is no ambient global state.

use crate::analysis::{detection_artifact, face_artifact, NatureAnalyzer};
use crate::annotate::AnnotationRenderer;
use crate::cache::ResultCache;
use crate::core::config::Config;
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::*;
use crate::storage::blob_store::{annotated_object_name, BlobStore};
use crate::storage::ContentStore;
use crate::utils::hashing::param_fingerprint;
use crate::utils::metrics::Metrics;
use crate::vision::{Feature, VisionClient};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use xxhash_rust::xxh3::xxh3_64;

pub struct Coordinator {
    pub config: Arc<Config>,
    content: Arc<ContentStore>,
    blobs: Arc<dyn BlobStore>,
    vision: Arc<VisionClient>,
    cache: Arc<ResultCache>,
    nature: NatureAnalyzer,
    renderer: AnnotationRenderer,
    metrics: Metrics,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        content: Arc<ContentStore>,
        blobs: Arc<dyn BlobStore>,
        vision: Arc<VisionClient>,
        cache: Arc<ResultCache>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            content,
            blobs,
            vision,
            cache,
            nature: NatureAnalyzer::new(),
            renderer: AnnotationRenderer::new(),
            metrics,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ===== image lifecycle =====

    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> ApiResult<IngestResult> {
        let size = bytes.len() as u64;
        let result = self.content.ingest(bytes, filename, mime_type).await?;
        self.metrics.record_upload(size, result.is_duplicate);
        Ok(result)
    }

    pub fn image_info(&self, image_hash: &str) -> ApiResult<ImageRecord> {
        self.content.lookup(image_hash)
    }

    pub fn list_images(
        &self,
        offset: usize,
        limit: usize,
        mime_filter: Option<&str>,
    ) -> (Vec<ImageRecord>, usize) {
        self.content.list(offset, limit.clamp(1, 500), mime_filter)
    }

    pub fn check_duplicate(&self, image_hash: &str) -> ApiResult<(bool, Vec<SimilarImage>)> {
        self.content.check_duplicate(image_hash)
    }

    /// Delete an image: blob, metadata, and every cache entry under the
    /// hash.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, image_hash: &str) -> ApiResult<usize> {
        self.content.delete(image_hash).await?;
        let cleared = self.cache.clear_hash(image_hash).await;
        info!("deleted {} and {} cache entries", image_hash, cleared);
        Ok(cleared)
    }

    // ===== analysis =====

    fn validate_analyze_params(params: &AnalyzeParams) -> ApiResult<()> {
        if !(0.0..=1.0).contains(&params.confidence_threshold) {
            return Err(ApiError::validation(format!(
                "confidence_threshold must be in [0, 1], got {}",
                params.confidence_threshold
            )));
        }
        if params.max_results == 0 {
            return Err(ApiError::validation("max_results must be > 0"));
        }
        Ok(())
    }

    fn validate_nature_params(params: &NatureParams) -> ApiResult<()> {
        if !(0.0..=1.0).contains(&params.confidence_threshold) {
            return Err(ApiError::validation(format!(
                "confidence_threshold must be in [0, 1], got {}",
                params.confidence_threshold
            )));
        }
        Ok(())
    }

    fn validate_render_request(request: &RenderRequest) -> ApiResult<()> {
        if !(1..=100).contains(&request.quality) {
            return Err(ApiError::validation(format!(
                "quality must be in [1, 100], got {}",
                request.quality
            )));
        }
        if !(0.0..=1.0).contains(&request.confidence_threshold) {
            return Err(ApiError::validation(format!(
                "confidence_threshold must be in [0, 1], got {}",
                request.confidence_threshold
            )));
        }
        if request.max_objects == 0 {
            return Err(ApiError::validation("max_objects must be > 0"));
        }
        Ok(())
    }

    /// Detect or face analysis behind the cache. Returns the artifact and
    /// whether it was served from cache.
    #[instrument(skip(self, params))]
    pub async fn analyze(
        &self,
        image_hash: &str,
        kind: ResultKind,
        params: &AnalyzeParams,
        force_refresh: bool,
    ) -> ApiResult<(Arc<AnalysisArtifact>, bool)> {
        if !matches!(kind, ResultKind::Detect | ResultKind::Faces) {
            return Err(ApiError::validation(format!(
                "kind {kind} is not a direct analysis kind"
            )));
        }
        Self::validate_analyze_params(params)?;
        // Resolve before any upstream work so unknown hashes fail fast
        self.content.lookup(image_hash)?;

        let fingerprint = param_fingerprint(params)?;
        let compute = || async {
            let bytes = self.content.fetch_bytes(image_hash).await?;
            let features: &[Feature] = match kind {
                ResultKind::Detect => &[
                    Feature::ObjectLocalization,
                    Feature::Label,
                    Feature::SafeSearch,
                ],
                _ => &[Feature::Face],
            };
            let bundle = self.vision.annotate(&bytes, features).await?;
            self.metrics.record_analysis();
            Ok(match kind {
                ResultKind::Detect => AnalysisArtifact::Detect(detection_artifact(&bundle, params)),
                _ => AnalysisArtifact::Faces(face_artifact(&bundle, params)),
            })
        };

        let result = if force_refresh {
            match compute().await {
                Ok(artifact) => {
                    let artifact = Arc::new(artifact);
                    self.cache
                        .put(kind, image_hash, &fingerprint, Arc::clone(&artifact), None)
                        .await;
                    Ok((artifact, false))
                }
                Err(err) => Err(err),
            }
        } else {
            self.cache
                .get_or_compute(kind, image_hash, &fingerprint, None, compute)
                .await
        };

        match result {
            // Circuit open: degraded empty result so the client surfaces
            // degraded mode instead of retrying. Never cached, so the next
            // request observes recovery immediately.
            Err(ApiError::ServiceUnavailable { .. }) => {
                Ok((Arc::new(degraded_artifact(kind)), false))
            }
            other => other,
        }
    }

    #[instrument(skip(self, params))]
    pub async fn analyze_nature(
        &self,
        image_hash: &str,
        params: &NatureParams,
        force_refresh: bool,
    ) -> ApiResult<(Arc<AnalysisArtifact>, bool)> {
        Self::validate_nature_params(params)?;
        self.content.lookup(image_hash)?;

        let fingerprint = param_fingerprint(params)?;
        let compute = || async {
            let bytes = self.content.fetch_bytes(image_hash).await?;
            let bundle = self
                .vision
                .annotate(&bytes, &[Feature::Label, Feature::ImageProperties])
                .await?;
            self.metrics.record_analysis();
            Ok(AnalysisArtifact::Nature(self.nature.analyze(&bundle, params)))
        };

        let result = if force_refresh {
            match compute().await {
                Ok(artifact) => {
                    let artifact = Arc::new(artifact);
                    self.cache
                        .put(
                            ResultKind::Nature,
                            image_hash,
                            &fingerprint,
                            Arc::clone(&artifact),
                            None,
                        )
                        .await;
                    Ok((artifact, false))
                }
                Err(err) => Err(err),
            }
        } else {
            self.cache
                .get_or_compute(ResultKind::Nature, image_hash, &fingerprint, None, compute)
                .await
        };

        match result {
            Err(ApiError::ServiceUnavailable { .. }) => {
                Ok((Arc::new(degraded_artifact(ResultKind::Nature)), false))
            }
            other => other,
        }
    }

    /// Render (or reuse) an annotated download. Derived from the detect and
    /// faces artifacts, which are themselves cached.
    #[instrument(skip(self, request))]
    pub async fn download_annotated(
        &self,
        image_hash: &str,
        request: &RenderRequest,
    ) -> ApiResult<(Arc<AnalysisArtifact>, bool)> {
        Self::validate_render_request(request)?;
        self.content.lookup(image_hash)?;

        let fingerprint = param_fingerprint(request)?;
        let compute = || async {
            // Permissive source artifacts; the renderer applies the
            // request's own threshold and cap.
            let source_params = AnalyzeParams {
                confidence_threshold: 0.0,
                max_results: 100,
                include_labels: false,
                include_faces: true,
            };
            let (detect, _) = self
                .analyze(image_hash, ResultKind::Detect, &source_params, false)
                .await?;
            let (faces, _) = self
                .analyze(image_hash, ResultKind::Faces, &source_params, false)
                .await?;

            let AnalysisArtifact::Detect(detections) = (*detect).clone() else {
                return Err(ApiError::processing("annotate", "detect artifact shape"));
            };
            let AnalysisArtifact::Faces(face_art) = (*faces).clone() else {
                return Err(ApiError::processing("annotate", "faces artifact shape"));
            };
            // Degraded sources would render (and cache) a blank image;
            // refuse instead so nothing misleading is persisted.
            if !detections.enabled || !face_art.enabled {
                return Err(ApiError::unavailable("vision", None));
            }

            let bytes = self.content.fetch_bytes(image_hash).await?;
            let output = self
                .renderer
                .render(bytes, detections, face_art, request.clone())
                .await?;

            // Deterministic id so re-renders of the same request reuse the
            // same blob name.
            let annotation_id = format!(
                "{:016x}",
                xxh3_64(format!("{image_hash}:{fingerprint}").as_bytes())
            );
            let object_name = annotated_object_name(&annotation_id, request.format.ext());
            let size_bytes = output.bytes.len() as u64;
            let blob_url = self
                .blobs
                .put(&object_name, output.bytes, request.format.mime())
                .await?;

            Ok(AnalysisArtifact::Annotate(AnnotatedImageArtifact {
                annotation_id,
                blob_url,
                format: request.format,
                width: output.width,
                height: output.height,
                size_bytes,
                stats: output.stats,
            }))
        };

        self.cache
            .get_or_compute(ResultKind::Annotate, image_hash, &fingerprint, None, compute)
            .await
    }

    /// Batch entry point: one (image, kind) unit of work with JSON params.
    pub async fn compute_item(
        &self,
        image_hash: &str,
        kind: ResultKind,
        params: &serde_json::Value,
    ) -> ApiResult<(Arc<AnalysisArtifact>, bool)> {
        match kind {
            ResultKind::Detect | ResultKind::Faces => {
                let params: AnalyzeParams = serde_json::from_value(params.clone())
                    .map_err(|e| ApiError::validation(format!("bad analyze params: {e}")))?;
                self.analyze(image_hash, kind, &params, false).await
            }
            ResultKind::Nature => {
                let params: NatureParams = serde_json::from_value(params.clone())
                    .map_err(|e| ApiError::validation(format!("bad nature params: {e}")))?;
                self.analyze_nature(image_hash, &params, false).await
            }
            ResultKind::Annotate => {
                let request: RenderRequest = serde_json::from_value(params.clone())
                    .map_err(|e| ApiError::validation(format!("bad render request: {e}")))?;
                self.download_annotated(image_hash, &request).await
            }
            ResultKind::Segment | ResultKind::Extract | ResultKind::Batch => Err(
                ApiError::validation(format!("kind {kind} cannot be computed directly")),
            ),
        }
    }

    // ===== cache administration =====

    pub async fn invalidate_version(&self, kind: ResultKind) -> u64 {
        self.cache.invalidate_version(kind).await
    }

    pub async fn clear_cache(&self, image_hash: Option<&str>) -> usize {
        match image_hash {
            Some(hash) => self.cache.clear_hash(hash).await,
            None => self.cache.clear_all().await,
        }
    }

    /// Pre-compute common entries for a set of images.
    pub async fn warm(&self, image_hashes: &[String], kinds: &[ResultKind]) -> usize {
        let mut warmed = 0;
        for hash in image_hashes {
            for kind in kinds {
                let result = match kind {
                    ResultKind::Detect | ResultKind::Faces => {
                        self.analyze(hash, *kind, &AnalyzeParams::default(), false)
                            .await
                    }
                    ResultKind::Nature => {
                        let params = NatureParams {
                            confidence_threshold: self.config.analyzer.confidence_threshold,
                            ..Default::default()
                        };
                        self.analyze_nature(hash, &params, false).await
                    }
                    _ => continue,
                };
                if matches!(result, Ok((_, false))) {
                    warmed += 1;
                }
            }
        }
        warmed
    }

    pub fn storage_stats(&self) -> (usize, u64) {
        (self.content.record_count(), self.content.total_bytes())
    }

    /// Wrap an operation outcome in the uniform response envelope.
    pub fn envelope<T: serde::Serialize>(
        result: ApiResult<(T, bool)>,
        started: Instant,
    ) -> Envelope<T> {
        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok((value, from_cache)) => Envelope::ok(value, from_cache, elapsed),
            Err(err) => Envelope::err(&err, elapsed),
        }
    }
}

/// Empty artifact carrying the degraded marker, handed out when the vision
/// circuit is open.
fn degraded_artifact(kind: ResultKind) -> AnalysisArtifact {
    match kind {
        ResultKind::Faces => AnalysisArtifact::Faces(FaceArtifact {
            faces: vec![],
            total_faces: 0,
            enabled: false,
        }),
        ResultKind::Nature => AnalysisArtifact::Nature(NatureArtifact {
            coverage: ElementCategory::ALL.iter().map(|c| (*c, 0.0)).collect(),
            categories: vec![],
            vegetation_health: None,
            seasonal: None,
            dominant_colors: vec![],
            color_diversity_score: 0.0,
            overall_assessment: "unknown".to_string(),
            recommendations: vec![],
            total_labels_analyzed: 0,
            enabled: false,
        }),
        _ => AnalysisArtifact::Detect(DetectionArtifact {
            detections: vec![],
            labels: vec![],
            safe_search: None,
            enabled: false,
        }),
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Shared fixtures for coordinator and batch tests: an in-memory stack
    //! with a canned, call-counting vision backend.

    use super::*;
    use crate::core::config::*;
    use crate::storage::MemoryBlobStore;
    use crate::vision::client::VisionBackend;
    use crate::vision::types::WireResponse;
    use crate::vision::Feature;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const CANNED_RESPONSE: &str = r#"{
        "labelAnnotations": [
            {"description": "Tree", "score": 0.95, "topicality": 0.93},
            {"description": "Grass", "score": 0.9, "topicality": 0.9},
            {"description": "Lush vegetation", "score": 0.8, "topicality": 0.8},
            {"description": "Sky", "score": 0.7, "topicality": 0.7},
            {"description": "Pond", "score": 0.5, "topicality": 0.5}
        ],
        "localizedObjectAnnotations": [
            {"name": "tree", "score": 0.95, "boundingPoly": {"normalizedVertices": [
                {"x": 0.1, "y": 0.2}, {"x": 0.4, "y": 0.2}, {"x": 0.4, "y": 0.7}, {"x": 0.1, "y": 0.7}
            ]}},
            {"name": "bench", "score": 0.75, "boundingPoly": {"normalizedVertices": [
                {"x": 0.5, "y": 0.6}, {"x": 0.7, "y": 0.6}, {"x": 0.7, "y": 0.8}, {"x": 0.5, "y": 0.8}
            ]}},
            {"name": "duck", "score": 0.45, "boundingPoly": {"normalizedVertices": [
                {"x": 0.8, "y": 0.8}, {"x": 0.9, "y": 0.8}, {"x": 0.9, "y": 0.9}, {"x": 0.8, "y": 0.9}
            ]}}
        ],
        "faceAnnotations": [
            {"detectionConfidence": 0.9, "boundingPoly": {"vertices": [
                {"x": 20, "y": 10}, {"x": 60, "y": 10}, {"x": 60, "y": 50}, {"x": 20, "y": 50}
            ]}, "joyLikelihood": "LIKELY", "angerLikelihood": "VERY_UNLIKELY"}
        ],
        "imagePropertiesAnnotation": {"dominantColors": {"colors": [
            {"color": {"red": 50, "green": 160, "blue": 60}, "score": 0.5, "pixelFraction": 0.5},
            {"color": {"red": 130, "green": 190, "blue": 240}, "score": 0.3, "pixelFraction": 0.3}
        ]}}
    }"#;

    pub struct CannedVision {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl VisionBackend for CannedVision {
        async fn annotate(
            &self,
            _bytes: &[u8],
            _features: &[Feature],
        ) -> ApiResult<WireResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_str(CANNED_RESPONSE).unwrap())
        }
    }

    pub fn test_config(dir: &std::path::Path) -> Config {
        let ttls: HashMap<ResultKind, Duration> = ResultKind::ALL
            .iter()
            .map(|k| (*k, Duration::from_secs(3600)))
            .collect();
        Config {
            server: ServerConfig {
                port: 0,
                host: "127.0.0.1".to_string(),
                log_level: tracing::Level::WARN,
                request_timeout: Duration::from_secs(60),
            },
            storage: StorageConfig {
                max_upload_bytes: 10 * 1024 * 1024,
                allowed_mime_types: vec!["image/png".to_string(), "image/jpeg".to_string()],
                similarity_hamming_threshold: 5,
                mode: "memory".to_string(),
                blob_base_url: String::new(),
                metadata_path: dir.join("metadata.json").to_string_lossy().into_owned(),
            },
            vision: VisionConfig {
                endpoint: String::new(),
                api_key: String::new(),
                call_timeout: Duration::from_secs(2),
                breaker_failure_threshold: 5,
                breaker_recovery: Duration::from_secs(60),
            },
            cache: CacheConfig {
                max_bytes: 64 * 1024 * 1024,
                redis_url: None,
                io_timeout: Duration::from_secs(2),
                single_flight_timeout: Duration::from_secs(5),
                ttls,
            },
            retry: RetryConfig {
                max_attempts: 2,
                base: Duration::from_millis(1),
                factor: 2,
                jitter_pct: 0,
                max_delay: Duration::from_millis(4),
            },
            batch: BatchConfig {
                default_concurrency: 8,
                retry_attempts: 3,
            },
            analyzer: AnalyzerConfig {
                confidence_threshold: 0.3,
            },
        }
    }

    pub struct TestStack {
        pub coordinator: Arc<Coordinator>,
        pub vision: Arc<CannedVision>,
        pub vision_client: Arc<VisionClient>,
        pub blobs: Arc<MemoryBlobStore>,
        _dir: tempfile::TempDir,
    }

    pub async fn stack() -> TestStack {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let content = Arc::new(
            ContentStore::new(config.storage.clone(), blobs.clone() as Arc<dyn BlobStore>)
                .await
                .unwrap(),
        );
        let vision_backend = Arc::new(CannedVision {
            calls: AtomicUsize::new(0),
        });
        let vision = Arc::new(VisionClient::with_backend(
            vision_backend.clone(),
            &config.vision,
            &config.retry,
            None,
        ));
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&config),
            content,
            blobs.clone() as Arc<dyn BlobStore>,
            Arc::clone(&vision),
            cache,
            Metrics::new(),
        ));
        TestStack {
            coordinator,
            vision: vision_backend,
            vision_client: vision,
            blobs,
            _dir: dir,
        }
    }

    pub fn park_png() -> Vec<u8> {
        use image::{DynamicImage, Rgb, RgbImage};
        let mut img = RgbImage::new(120, 100);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = Rgb([(x * 2) as u8, 150, (y * 2) as u8]);
        }
        crate::utils::image_ops::encode_image_sync(
            &DynamicImage::ImageRgb8(img),
            crate::core::types::ImageFormat::Png,
            95,
        )
        .unwrap()
    }

    pub async fn upload_park(stack: &TestStack) -> String {
        stack
            .coordinator
            .upload(park_png(), "park.png", "image/png")
            .await
            .unwrap()
            .record
            .image_hash
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn analyze_cold_then_warm_cache() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        let (artifact, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert!(!from_cache);
        assert_eq!(artifact.kind(), ResultKind::Detect);
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 1);

        let (_, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert!(from_cache);
        // Vision was not consulted again
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_invalidation_forces_recompute() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 1);

        let version = stack.coordinator.invalidate_version(ResultKind::Detect).await;
        assert_eq!(version, 2);

        let (_, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert!(!from_cache);
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        let (_, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), true)
            .await
            .unwrap();
        assert!(!from_cache);
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_hash_fails_before_upstream() {
        let stack = stack().await;
        let err = stack
            .coordinator
            .analyze(
                "0000000000000000000000000000dead",
                ResultKind::Detect,
                &AnalyzeParams::default(),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IMAGE_NOT_FOUND");
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parameter_validation_is_terminal() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        let params = AnalyzeParams {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        let err = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &params, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let mut render = RenderRequest::default();
        render.quality = 0;
        let err = stack
            .coordinator
            .download_annotated(&hash, &render)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn nature_analysis_end_to_end() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        let (artifact, from_cache) = stack
            .coordinator
            .analyze_nature(&hash, &NatureParams::default(), false)
            .await
            .unwrap();
        assert!(!from_cache);

        let AnalysisArtifact::Nature(nature) = &*artifact else {
            panic!("expected nature artifact");
        };
        let coverage_sum: f32 = nature.coverage.values().sum();
        assert!(coverage_sum > 0.0 && coverage_sum <= 102.0);
        assert!(nature.vegetation_health.is_some());
        assert!(!nature.dominant_colors.is_empty());

        // Equivalent parameter spellings share the cache entry
        let (_, from_cache) = stack
            .coordinator
            .analyze_nature(&hash, &NatureParams::default(), false)
            .await
            .unwrap();
        assert!(from_cache);
    }

    #[tokio::test]
    async fn annotated_download_writes_blob_and_caches() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;
        let blobs_before = stack.blobs.object_count();

        let request = RenderRequest {
            confidence_threshold: 0.7,
            max_objects: 20,
            ..Default::default()
        };
        let (artifact, from_cache) = stack
            .coordinator
            .download_annotated(&hash, &request)
            .await
            .unwrap();
        assert!(!from_cache);

        let AnalysisArtifact::Annotate(annotated) = &*artifact else {
            panic!("expected annotate artifact");
        };
        assert_eq!(annotated.format, ImageFormat::Png);
        assert!(annotated.stats.total_objects <= 20);
        assert!(annotated.stats.confidence.min >= 0.7);
        assert!(annotated.blob_url.contains("annotated/"));
        assert!(annotated.size_bytes > 0);
        assert_eq!(stack.blobs.object_count(), blobs_before + 1);

        // Second request is a pure cache hit: no new blob, no new render
        let (again, from_cache) = stack
            .coordinator
            .download_annotated(&hash, &request)
            .await
            .unwrap();
        assert!(from_cache);
        let AnalysisArtifact::Annotate(again) = &*again else {
            panic!("expected annotate artifact");
        };
        assert_eq!(again.annotation_id, annotated.annotation_id);
        assert_eq!(stack.blobs.object_count(), blobs_before + 1);
    }

    #[tokio::test]
    async fn circuit_open_yields_degraded_result_not_error() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        // Trip the breaker (testkit threshold is 5)
        for _ in 0..5 {
            stack.vision_client.breaker().record_failure();
        }

        let (artifact, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert!(!from_cache);
        let AnalysisArtifact::Detect(detections) = &*artifact else {
            panic!("expected detect artifact");
        };
        assert!(!detections.enabled);
        assert!(detections.detections.is_empty());
        // Upstream was never contacted
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 0);

        let (artifact, _) = stack
            .coordinator
            .analyze_nature(&hash, &NatureParams::default(), false)
            .await
            .unwrap();
        let AnalysisArtifact::Nature(nature) = &*artifact else {
            panic!("expected nature artifact");
        };
        assert!(!nature.enabled);

        // The degraded result was not cached: once the provider recovers,
        // the next request computes for real
        stack.vision_client.breaker().reset();
        let (artifact, from_cache) = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        assert!(!from_cache);
        let AnalysisArtifact::Detect(detections) = &*artifact else {
            panic!("expected detect artifact");
        };
        assert!(detections.enabled);
        assert_eq!(stack.vision.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn annotate_refuses_degraded_sources() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        for _ in 0..5 {
            stack.vision_client.breaker().record_failure();
        }

        let err = stack
            .coordinator
            .download_annotated(&hash, &RenderRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
        // Nothing blank was rendered into blob storage
        assert_eq!(stack.blobs.object_count(), 1);
    }

    #[tokio::test]
    async fn delete_image_clears_cache_entries() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap();
        let cleared = stack.coordinator.delete_image(&hash).await.unwrap();
        assert!(cleared >= 1);

        let err = stack
            .coordinator
            .analyze(&hash, ResultKind::Detect, &AnalyzeParams::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IMAGE_NOT_FOUND");
    }

    #[tokio::test]
    async fn warm_precomputes_default_entries() {
        let stack = stack().await;
        let hash = upload_park(&stack).await;

        let warmed = stack
            .coordinator
            .warm(&[hash.clone()], &[ResultKind::Detect, ResultKind::Nature])
            .await;
        assert_eq!(warmed, 2);

        // Warm again: everything already cached
        let warmed = stack
            .coordinator
            .warm(&[hash], &[ResultKind::Detect, ResultKind::Nature])
            .await;
        assert_eq!(warmed, 0);
    }
}
