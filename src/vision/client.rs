// Vision primitives client
//
// One call surface: annotate(bytes, features). All requested features ride
// in a single upstream request, which halves quota cost versus per-feature
// calls. The client composes a per-call timeout, the shared retry policy
// and a circuit breaker; when the circuit is open callers fail immediately
// with a retry_after hint instead of queueing behind a dead upstream.

use crate::core::config::{RetryConfig, VisionConfig};
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{LabelAnnotation, Likelihood};
use crate::middleware::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::middleware::retry::{classify_reqwest, status_is_transient, RetryPolicy};
use crate::utils::image_ops::probe_dimensions;
use crate::utils::metrics::Metrics;
use crate::vision::types::*;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Transport seam. The HTTP implementation talks to the real provider;
/// tests substitute a canned backend.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn annotate(&self, bytes: &[u8], features: &[Feature]) -> ApiResult<WireResponse>;
}

/// HTTP backend posting a single batched annotate request.
pub struct HttpVisionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpVisionBackend {
    pub fn new(config: &VisionConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ApiError::vision(format!("http client init: {e}"), false))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl VisionBackend for HttpVisionBackend {
    async fn annotate(&self, bytes: &[u8], features: &[Feature]) -> ApiResult<WireResponse> {
        let content = general_purpose::STANDARD.encode(bytes);
        let feature_list: Vec<_> = features
            .iter()
            .map(|f| json!({"type": f.wire_name(), "maxResults": 50}))
            .collect();
        let body = json!({
            "requests": [{
                "image": {"content": content},
                "features": feature_list,
            }]
        });

        let url = if self.api_key.is_empty() {
            self.endpoint.clone()
        } else {
            format!("{}?key={}", self.endpoint, self.api_key)
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "vision"))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(ApiError::VisionService {
                message: format!("provider returned {status}"),
                transient: status_is_transient(status.as_u16()),
                retry_after_seconds: retry_after,
            });
        }

        let mut parsed: WireAnnotateResponse = response
            .json()
            .await
            .map_err(|e| ApiError::vision(format!("malformed provider response: {e}"), false))?;

        let result = parsed
            .responses
            .drain(..)
            .next()
            .ok_or_else(|| ApiError::vision("provider returned no responses", false));
        result
    }
}

/// The client the coordinator and analyzers talk to.
pub struct VisionClient {
    backend: Arc<dyn VisionBackend>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    metrics: Option<Metrics>,
}

impl VisionClient {
    pub fn new(
        vision: &VisionConfig,
        retry: &RetryConfig,
        metrics: Option<Metrics>,
    ) -> ApiResult<Self> {
        let backend = Arc::new(HttpVisionBackend::new(vision)?);
        Ok(Self::with_backend(backend, vision, retry, metrics))
    }

    /// Build around an arbitrary backend; the test seam.
    pub fn with_backend(
        backend: Arc<dyn VisionBackend>,
        vision: &VisionConfig,
        retry: &RetryConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: vision.breaker_failure_threshold,
            recovery_timeout: vision.breaker_recovery,
            success_threshold: 1,
        });
        Self {
            backend,
            breaker,
            retry: RetryPolicy::new(retry),
            call_timeout: vision.call_timeout,
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Annotate one image with the requested feature set.
    ///
    /// Partial results come back as a bundle with the successful sections
    /// plus a per-feature error map; only a fully failed call is an Err.
    #[instrument(skip(self, bytes), fields(len = bytes.len(), features = features.len()))]
    pub async fn annotate(&self, bytes: &[u8], features: &[Feature]) -> ApiResult<PrimitiveBundle> {
        if features.is_empty() {
            return Err(ApiError::validation("no features requested"));
        }

        if !self.breaker.allow_request() {
            let hint = self.breaker.retry_after_hint();
            debug!("vision circuit open, refusing request (retry in {:?}s)", hint);
            return Err(ApiError::unavailable("vision", hint));
        }

        let started = Instant::now();
        let result = self
            .retry
            .run("vision_annotate", || {
                let backend = Arc::clone(&self.backend);
                let features = features.to_vec();
                let bytes = bytes.to_vec();
                async move {
                    match tokio::time::timeout(self.call_timeout, backend.annotate(&bytes, &features))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::timeout("vision annotate")),
                    }
                }
            })
            .await;

        let elapsed = started.elapsed();
        match result {
            Ok(wire) => {
                self.breaker.record_success();
                if let Some(ref m) = self.metrics {
                    m.record_vision_call(true, elapsed);
                }
                let (width, height) = probe_dimensions(bytes).unwrap_or((1, 1));
                Ok(bundle_from_wire(wire, features, width, height))
            }
            Err(err) => {
                self.breaker.record_failure();
                if let Some(ref m) = self.metrics {
                    m.record_vision_call(false, elapsed);
                    if self.breaker.state() == crate::middleware::CircuitState::Open {
                        m.record_circuit_breaker_trip();
                    }
                }
                warn!("vision annotate failed after {:?}: {}", elapsed, err);
                Err(err)
            }
        }
    }
}

/// Normalize the wire response into the analyzer-facing bundle.
fn bundle_from_wire(
    wire: WireResponse,
    requested: &[Feature],
    width: u32,
    height: u32,
) -> PrimitiveBundle {
    let mut bundle = PrimitiveBundle::default();

    if let Some(labels) = wire.label_annotations {
        bundle.labels = labels
            .into_iter()
            .map(|l| LabelAnnotation {
                description: l.description,
                confidence: l.score.clamp(0.0, 1.0),
                topicality: l.topicality.clamp(0.0, 1.0),
            })
            .collect();
    }

    if let Some(objects) = wire.localized_object_annotations {
        bundle.objects = objects
            .into_iter()
            .map(|o| RawObject {
                bbox: bbox_from_normalized(&o.bounding_poly),
                name: o.name,
                score: o.score.clamp(0.0, 1.0),
            })
            .collect();
    }

    if let Some(faces) = wire.face_annotations {
        bundle.faces = faces
            .into_iter()
            .map(|f| {
                let parse = |s: &Option<String>| {
                    s.as_deref().map(Likelihood::parse).unwrap_or(Likelihood::Unknown)
                };
                RawFace {
                    confidence: f.detection_confidence.clamp(0.0, 1.0),
                    bbox: bbox_from_pixels(&f.bounding_poly, width, height),
                    landmarks: f
                        .landmarks
                        .iter()
                        .map(|l| RawLandmark {
                            kind: l.kind.clone(),
                            x: (l.position.x / width.max(1) as f32).clamp(0.0, 1.0),
                            y: (l.position.y / height.max(1) as f32).clamp(0.0, 1.0),
                        })
                        .collect(),
                    anger: parse(&f.anger_likelihood),
                    joy: parse(&f.joy_likelihood),
                    sorrow: parse(&f.sorrow_likelihood),
                    surprise: parse(&f.surprise_likelihood),
                    blurred: parse(&f.blurred_likelihood),
                    headwear: parse(&f.headwear_likelihood),
                }
            })
            .collect();
    }

    if let Some(properties) = wire.image_properties_annotation {
        if let Some(colors) = properties.dominant_colors {
            bundle.dominant_colors = colors
                .colors
                .into_iter()
                .map(|c| RawDominantColor {
                    red: c.color.red.clamp(0.0, 255.0) as u8,
                    green: c.color.green.clamp(0.0, 255.0) as u8,
                    blue: c.color.blue.clamp(0.0, 255.0) as u8,
                    pixel_fraction: c.pixel_fraction.clamp(0.0, 1.0),
                    score: c.score.clamp(0.0, 1.0),
                })
                .collect();
        }
    }

    bundle.safe_search = wire.safe_search_annotation.as_ref().map(Into::into);

    // Requested features that came back empty-handed get an entry in the
    // error map so callers can decide whether the remainder suffices.
    let error_message = wire
        .error
        .map(|e| format!("{} (code {})", e.message, e.code))
        .unwrap_or_else(|| "feature missing from response".to_string());
    for feature in requested {
        let present = match feature {
            Feature::Label => !bundle.labels.is_empty(),
            Feature::ObjectLocalization => !bundle.objects.is_empty(),
            Feature::Face => !bundle.faces.is_empty(),
            Feature::ImageProperties => !bundle.dominant_colors.is_empty(),
            Feature::SafeSearch => bundle.safe_search.is_some(),
        };
        if !present {
            bundle
                .feature_errors
                .insert(feature.wire_name().to_string(), error_message.clone());
        }
    }

    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vision_config() -> VisionConfig {
        VisionConfig {
            endpoint: "http://localhost:1/annotate".to_string(),
            api_key: String::new(),
            call_timeout: Duration::from_millis(200),
            breaker_failure_threshold: 3,
            breaker_recovery: Duration::from_millis(100),
        }
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            base: Duration::from_millis(1),
            factor: 2,
            jitter_pct: 0,
            max_delay: Duration::from_millis(2),
        }
    }

    struct CannedBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl VisionBackend for CannedBackend {
        async fn annotate(&self, _bytes: &[u8], _features: &[Feature]) -> ApiResult<WireResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::vision("upstream 503", true));
            }
            let json = r#"{
                "labelAnnotations": [
                    {"description": "Tree", "score": 0.95, "topicality": 0.9},
                    {"description": "Grass", "score": 0.8, "topicality": 0.8}
                ]
            }"#;
            Ok(serde_json::from_str(json).unwrap())
        }
    }

    #[tokio::test]
    async fn successful_annotate_builds_bundle_with_feature_errors() {
        let backend = Arc::new(CannedBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let client = VisionClient::with_backend(
            backend.clone(),
            &vision_config(),
            &retry_config(),
            None,
        );

        let bundle = client
            .annotate(b"fakebytes", &[Feature::Label, Feature::Face])
            .await
            .unwrap();

        assert_eq!(bundle.labels.len(), 2);
        // Faces were requested but absent: flagged, not fatal
        assert!(bundle.has_feature_error(Feature::Face));
        assert!(!bundle.has_feature_error(Feature::Label));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_fails_fast() {
        let backend = Arc::new(CannedBackend {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let client = VisionClient::with_backend(
            backend.clone(),
            &vision_config(),
            &retry_config(),
            None,
        );

        for _ in 0..3 {
            let _ = client.annotate(b"x", &[Feature::Label]).await;
        }
        let upstream_calls = backend.calls.load(Ordering::SeqCst);
        assert_eq!(upstream_calls, 3);

        // Circuit now open: refusal without touching the backend
        let err = client.annotate(b"x", &[Feature::Label]).await.unwrap_err();
        assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
        assert!(err.retry_after_seconds().is_some());
        assert_eq!(backend.calls.load(Ordering::SeqCst), upstream_calls);
    }

    #[tokio::test]
    async fn empty_feature_set_is_rejected() {
        let backend = Arc::new(CannedBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let client =
            VisionClient::with_backend(backend, &vision_config(), &retry_config(), None);
        let err = client.annotate(b"x", &[]).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
