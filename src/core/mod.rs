pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ApiError, ApiResult, ConfigError};
pub use types::{
    AnalysisArtifact, AnalyzeParams, BatchResult, Envelope, ImageRecord, IngestResult,
    NatureParams, RenderRequest, ResultKind,
};
