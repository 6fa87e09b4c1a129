// Error taxonomy for the analysis pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Stable machine-readable error codes (upper snake case)
// - Transient/terminal classification driving the retry policies
// - retry_after hints carried through to the response envelope
//
// Only the HTTP layer maps kinds to status codes; everything below it
// speaks ApiError.

use thiserror::Error;

/// Unified error type emitted by the core services.
///
/// Variants are Clone so single-flight waiters can all receive the same
/// error the leading computation produced.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("image not found: {image_hash}")]
    ImageNotFound { image_hash: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("rate limit exceeded (retry after {retry_after_seconds}s)")]
    RateLimited { retry_after_seconds: u64 },

    #[error("vision service error: {message}")]
    VisionService {
        message: String,
        transient: bool,
        retry_after_seconds: Option<u64>,
    },

    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("{service} unavailable")]
    ServiceUnavailable {
        service: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("cache error: {message}")]
    Cache { message: String },

    #[error("processing failed in {operation}: {message}")]
    Processing {
        operation: String,
        message: String,
        context: Option<String>,
    },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn image_not_found(image_hash: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image_hash: image_hash.into(),
        }
    }

    pub fn storage(message: impl Into<String>, transient: bool) -> Self {
        Self::Storage {
            message: message.into(),
            transient,
        }
    }

    pub fn vision(message: impl Into<String>, transient: bool) -> Self {
        Self::VisionService {
            message: message.into(),
            transient,
            retry_after_seconds: None,
        }
    }

    pub fn unavailable(service: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            retry_after_seconds,
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn processing(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            operation: operation.into(),
            message: message.into(),
            context: None,
        }
    }

    /// Stable machine-readable code surfaced in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::ImageNotFound { .. } => "IMAGE_NOT_FOUND",
            Self::NotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::VisionService { .. } => "VISION_SERVICE_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cache { .. } => "CACHE_ERROR",
            Self::Processing { .. } => "PROCESSING_ERROR",
        }
    }

    /// Whether a retry of the same operation can reasonably succeed.
    ///
    /// Validation, not-found and processing failures are terminal: retrying
    /// them replays the same inputs into the same deterministic failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VisionService { transient, .. } => *transient,
            Self::Storage { transient, .. } => *transient,
            Self::ServiceUnavailable { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => {
                true
            }
            Self::Cache { .. } => true,
            Self::Validation { .. }
            | Self::ImageNotFound { .. }
            | Self::NotFound { .. }
            | Self::Processing { .. } => false,
        }
    }

    /// Retry-after hint, when the failure carries one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            Self::VisionService {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            Self::ServiceUnavailable {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Configuration errors, separate from the request-path taxonomy since they
/// only occur at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("invalid cache config: {0}")]
    InvalidCacheConfig(String),

    #[error("invalid retry config: {0}")]
    InvalidRetryConfig(String),

    #[error("invalid batch config: {0}")]
    InvalidBatchConfig(String),

    #[error("invalid storage config: {0}")]
    InvalidStorageConfig(String),

    #[error("environment variable parsing failed: {0}")]
    EnvVarError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(ApiError::image_not_found("abc").code(), "IMAGE_NOT_FOUND");
        assert_eq!(ApiError::timeout("op").code(), "TIMEOUT");
        assert_eq!(
            ApiError::unavailable("vision", Some(60)).code(),
            "SERVICE_UNAVAILABLE"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(ApiError::vision("upstream 503", true).is_transient());
        assert!(!ApiError::vision("bad feature", false).is_transient());
        assert!(ApiError::timeout("annotate").is_transient());
        assert!(!ApiError::validation("quality out of range").is_transient());
        assert!(!ApiError::image_not_found("deadbeef").is_transient());
    }

    #[test]
    fn retry_after_passthrough() {
        let err = ApiError::unavailable("vision", Some(42));
        assert_eq!(err.retry_after_seconds(), Some(42));
        assert_eq!(ApiError::validation("x").retry_after_seconds(), None);
    }
}
