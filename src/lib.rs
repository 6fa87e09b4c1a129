// Library exports for the park image analysis serving layer

pub mod analysis;
pub mod annotate;
pub mod cache;
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod storage;
pub mod utils;
pub mod vision;

// Re-export commonly used types and services
pub use crate::core::{
    config::Config,
    errors::{ApiError, ApiResult, ConfigError},
    types::{
        AnalysisArtifact, AnalyzeParams, BatchResult, Envelope, ImageRecord, IngestResult,
        NatureParams, RenderRequest, ResultKind,
    },
};

pub use analysis::NatureAnalyzer;
pub use annotate::AnnotationRenderer;
pub use cache::ResultCache;
pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
pub use orchestration::{BatchOrchestrator, CancelToken, Coordinator};
pub use storage::{BlobStore, ContentStore, MemoryBlobStore, RemoteBlobStore};
pub use utils::Metrics;
pub use vision::{Feature, PrimitiveBundle, VisionClient};
