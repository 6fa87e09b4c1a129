// Batch orchestrator
//
// Fans a batch out as one logical job per (image, kind) pair on a bounded
// worker pool. Each job goes through the cache's single-flight path, so
// duplicates inside a batch collapse into one computation. Failures are
// isolated per item; a batch never fails wholesale because one image is
// missing or one upstream call died.

use crate::core::config::BatchConfig;
use crate::core::errors::ApiError;
use crate::core::types::{BatchItemError, BatchItemResult, BatchResult, BatchSummary, ResultKind};
use crate::middleware::retry::RetryPolicy;
use crate::orchestration::coordinator::Coordinator;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Cooperative cancellation flag shared with the caller. Jobs that have not
/// started when it trips are skipped; completed results are kept.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BatchOrchestrator {
    coordinator: Arc<Coordinator>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(coordinator: Arc<Coordinator>, config: BatchConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Run `image_hashes x kinds` with bounded concurrency. Results come
    /// back aligned to the input cartesian product (hash-major order).
    #[instrument(skip(self, params, cancel), fields(images = image_hashes.len(), kinds = kinds.len()))]
    pub async fn batch_analyze(
        &self,
        image_hashes: &[String],
        kinds: &[ResultKind],
        params: serde_json::Value,
        concurrency_limit: Option<usize>,
        cancel: CancelToken,
    ) -> BatchResult {
        let started = Instant::now();
        let batch_id = Uuid::new_v4().to_string();
        let concurrency = concurrency_limit
            .unwrap_or(self.config.default_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let params = Arc::new(params);

        info!(
            "batch {}: {} images x {} kinds, concurrency {}",
            batch_id,
            image_hashes.len(),
            kinds.len(),
            concurrency
        );

        // Per-job retry for transient failures only; terminal kinds
        // (validation, not-found) surface after the first occurrence.
        let job_retry = RetryPolicy::new(&crate::core::config::RetryConfig {
            max_attempts: self.config.retry_attempts,
            base: Duration::from_millis(200),
            factor: 2,
            jitter_pct: 25,
            max_delay: Duration::from_secs(5),
        });

        let mut tasks = Vec::new();
        let mut index = 0usize;
        for image_hash in image_hashes {
            for kind in kinds {
                let coordinator = Arc::clone(&self.coordinator);
                let semaphore = Arc::clone(&semaphore);
                let params = Arc::clone(&params);
                let cancel = cancel.clone();
                let retry = job_retry.clone();
                let image_hash = image_hash.clone();
                let kind = *kind;
                let job_index = index;
                index += 1;

                tasks.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return (job_index, cancelled_item(&image_hash, kind));
                    };
                    if cancel.is_cancelled() {
                        return (job_index, cancelled_item(&image_hash, kind));
                    }

                    let outcome = retry
                        .run("batch_item", || {
                            let coordinator = Arc::clone(&coordinator);
                            let image_hash = image_hash.clone();
                            let params = Arc::clone(&params);
                            async move { coordinator.compute_item(&image_hash, kind, &params).await }
                        })
                        .await;

                    let item = match outcome {
                        Ok((artifact, from_cache)) => BatchItemResult {
                            image_hash: image_hash.clone(),
                            kind,
                            success: true,
                            from_cache,
                            artifact: Some((*artifact).clone()),
                            error: None,
                        },
                        Err(err) => {
                            warn!("batch item {} {} failed: {}", image_hash, kind, err);
                            failed_item(&image_hash, kind, &err)
                        }
                    };
                    (job_index, item)
                }));
            }
        }

        let total = index;
        let mut items: Vec<Option<BatchItemResult>> = (0..total).map(|_| None).collect();
        for joined in join_all(tasks).await {
            match joined {
                Ok((job_index, item)) => items[job_index] = Some(item),
                Err(e) => warn!("batch task panicked: {e}"),
            }
        }

        // A panicked task leaves a hole; surface it as a processing failure
        // rather than silently shrinking the result array.
        let items: Vec<BatchItemResult> = items
            .into_iter()
            .enumerate()
            .map(|(job_index, item)| {
                item.unwrap_or_else(|| {
                    let image_hash = &image_hashes[job_index / kinds.len().max(1)];
                    let kind = kinds[job_index % kinds.len().max(1)];
                    failed_item(
                        image_hash,
                        kind,
                        &ApiError::processing("batch", "worker terminated unexpectedly"),
                    )
                })
            })
            .collect();

        let success = items.iter().filter(|i| i.success).count();
        let failed = items.len() - success;
        let cache_hit_count = items.iter().filter(|i| i.from_cache).count();
        let summary = BatchSummary {
            total,
            success,
            failed,
            partial: cancel.is_cancelled(),
            cache_hit_count,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        self.coordinator.metrics().record_batch_items(total, failed);
        info!(
            "batch {} done: {}/{} ok, {} cache hits, {:.1}s",
            batch_id,
            success,
            total,
            cache_hit_count,
            started.elapsed().as_secs_f64()
        );

        BatchResult {
            batch_id,
            summary,
            items,
        }
    }
}

fn failed_item(image_hash: &str, kind: ResultKind, err: &ApiError) -> BatchItemResult {
    BatchItemResult {
        image_hash: image_hash.to_string(),
        kind,
        success: false,
        from_cache: false,
        artifact: None,
        error: Some(BatchItemError {
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            retry_hint: err.is_transient(),
        }),
    }
}

fn cancelled_item(image_hash: &str, kind: ResultKind) -> BatchItemResult {
    BatchItemResult {
        image_hash: image_hash.to_string(),
        kind,
        success: false,
        from_cache: false,
        artifact: None,
        error: Some(BatchItemError {
            error_code: "CANCELLED".to_string(),
            error_message: "batch cancelled before this item started".to_string(),
            retry_hint: true,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::coordinator::testkit::{stack, upload_park};

    fn orchestrator_for(stack: &crate::orchestration::coordinator::testkit::TestStack) -> BatchOrchestrator {
        BatchOrchestrator::new(
            Arc::clone(&stack.coordinator),
            stack.coordinator.config.batch.clone(),
        )
    }

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let stack = stack().await;
        let h1 = upload_park(&stack).await;
        let missing = "ffffffffffffffffffffffffffffffff".to_string();

        let orchestrator = orchestrator_for(&stack);
        let result = orchestrator
            .batch_analyze(
                &[h1.clone(), missing.clone()],
                &[ResultKind::Detect],
                serde_json::json!({}),
                None,
                CancelToken::new(),
            )
            .await;

        assert_eq!(result.summary.total, 2);
        assert_eq!(result.summary.success, 1);
        assert_eq!(result.summary.failed, 1);
        assert!(!result.summary.partial);

        // Items are aligned to the input order
        assert_eq!(result.items[0].image_hash, h1);
        assert!(result.items[0].success);
        assert!(result.items[0].artifact.is_some());

        assert_eq!(result.items[1].image_hash, missing);
        assert!(!result.items[1].success);
        let error = result.items[1].error.as_ref().unwrap();
        assert_eq!(error.error_code, "IMAGE_NOT_FOUND");
        assert!(!error.retry_hint);
    }

    #[tokio::test]
    async fn duplicate_work_collapses_and_cache_hits_are_counted() {
        let stack = stack().await;
        let h1 = upload_park(&stack).await;

        let orchestrator = orchestrator_for(&stack);
        // Two kinds over one image, twice: second batch is all cache hits
        let kinds = [ResultKind::Detect, ResultKind::Nature];
        let first = orchestrator
            .batch_analyze(
                &[h1.clone()],
                &kinds,
                serde_json::json!({}),
                Some(4),
                CancelToken::new(),
            )
            .await;
        assert_eq!(first.summary.success, 2);

        let second = orchestrator
            .batch_analyze(&[h1], &kinds, serde_json::json!({}), Some(4), CancelToken::new())
            .await;
        assert_eq!(second.summary.success, 2);
        assert_eq!(second.summary.cache_hit_count, 2);
        assert!(second.items.iter().all(|i| i.from_cache));
    }

    #[tokio::test]
    async fn alignment_covers_cartesian_product() {
        let stack = stack().await;
        let h1 = upload_park(&stack).await;

        let orchestrator = orchestrator_for(&stack);
        let kinds = [ResultKind::Detect, ResultKind::Faces];
        let result = orchestrator
            .batch_analyze(
                &[h1.clone()],
                &kinds,
                serde_json::json!({}),
                None,
                CancelToken::new(),
            )
            .await;

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0].kind, ResultKind::Detect);
        assert_eq!(result.items[1].kind, ResultKind::Faces);
        assert!(result.items.iter().all(|i| i.image_hash == h1));
    }

    #[tokio::test]
    async fn pre_cancelled_batch_returns_partial() {
        let stack = stack().await;
        let h1 = upload_park(&stack).await;

        let cancel = CancelToken::new();
        cancel.cancel();

        let orchestrator = orchestrator_for(&stack);
        let result = orchestrator
            .batch_analyze(
                &[h1],
                &[ResultKind::Detect],
                serde_json::json!({}),
                None,
                cancel,
            )
            .await;

        assert!(result.summary.partial);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(
            result.items[0].error.as_ref().unwrap().error_code,
            "CANCELLED"
        );
    }

    #[tokio::test]
    async fn unsupported_kind_is_a_terminal_item_error() {
        let stack = stack().await;
        let h1 = upload_park(&stack).await;

        let orchestrator = orchestrator_for(&stack);
        let result = orchestrator
            .batch_analyze(
                &[h1],
                &[ResultKind::Segment],
                serde_json::json!({}),
                None,
                CancelToken::new(),
            )
            .await;

        assert_eq!(result.summary.failed, 1);
        let error = result.items[0].error.as_ref().unwrap();
        assert_eq!(error.error_code, "VALIDATION_ERROR");
        assert!(!error.retry_hint);
    }
}
