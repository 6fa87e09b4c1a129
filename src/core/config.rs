use crate::core::errors::ConfigError;
use crate::core::types::ResultKind;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub request_timeout: Duration,
}

/// Upload / content-store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub similarity_hamming_threshold: u32,
    /// "memory" keeps blobs in-process; "remote" talks to an object store
    pub mode: String,
    pub blob_base_url: String,
    pub metadata_path: String,
}

/// Vision provider configuration
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub call_timeout: Duration,
    pub breaker_failure_threshold: usize,
    pub breaker_recovery: Duration,
}

/// Result cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub redis_url: Option<String>,
    pub io_timeout: Duration,
    pub single_flight_timeout: Duration,
    pub ttls: HashMap<ResultKind, Duration>,
}

impl CacheConfig {
    pub fn ttl_for(&self, kind: ResultKind) -> Duration {
        self.ttls
            .get(&kind)
            .copied()
            .unwrap_or(Duration::from_secs(24 * 3600))
    }
}

/// Retry policy configuration shared by the blob adapter and vision client
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub jitter_pct: u32,
    pub max_delay: Duration,
}

/// Batch orchestrator configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub default_concurrency: usize,
    pub retry_attempts: u32,
}

/// Analyzer configuration
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub confidence_threshold: f32,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub vision: VisionConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub analyzer: AnalyzerConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default per-kind TTL table. Expensive results are kept longest; batch
/// progress state is deliberately short-lived.
fn default_ttls() -> HashMap<ResultKind, Duration> {
    let hours = |h: u64| Duration::from_secs(h * 3600);
    HashMap::from([
        (ResultKind::Detect, hours(24)),
        (ResultKind::Faces, hours(24)),
        (ResultKind::Nature, hours(48)),
        (ResultKind::Annotate, hours(72)),
        (ResultKind::Segment, hours(7 * 24)),
        (ResultKind::Extract, hours(30 * 24)),
        (ResultKind::Batch, hours(1)),
    ])
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let allowed_mime_types = env::var("ALLOWED_MIME_TYPES")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_ascii_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "image/jpeg".to_string(),
                    "image/png".to_string(),
                    "image/gif".to_string(),
                    "image/bmp".to_string(),
                    "image/webp".to_string(),
                ]
            });

        // Per-kind TTL overrides, e.g. CACHE_TTL_NATURE_HOURS=96
        let mut ttls = default_ttls();
        for kind in ResultKind::ALL {
            let key = format!("CACHE_TTL_{}_HOURS", kind.prefix().to_uppercase());
            if let Some(hours) = env::var(&key).ok().and_then(|s| s.parse::<u64>().ok()) {
                ttls.insert(kind, Duration::from_secs(hours * 3600));
            }
        }

        Ok(Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT", 8420),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECONDS", 60)),
            },
            storage: StorageConfig {
                max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
                allowed_mime_types,
                similarity_hamming_threshold: env_parse("SIMILARITY_HAMMING_THRESHOLD", 5),
                mode: env::var("STORAGE_MODE").unwrap_or_else(|_| "memory".to_string()),
                blob_base_url: env::var("BLOB_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:9000/parklens".to_string()),
                metadata_path: env::var("METADATA_PATH")
                    .unwrap_or_else(|_| ".parklens/metadata.json".to_string()),
            },
            vision: VisionConfig {
                endpoint: env::var("VISION_ENDPOINT").unwrap_or_else(|_| {
                    "https://vision.googleapis.com/v1/images:annotate".to_string()
                }),
                api_key: env::var("VISION_API_KEY").unwrap_or_default(),
                call_timeout: Duration::from_secs(env_parse("VISION_TIMEOUT_SECONDS", 15)),
                breaker_failure_threshold: env_parse("VISION_CB_FAILURE_THRESHOLD", 5),
                breaker_recovery: Duration::from_secs(env_parse("VISION_CB_RECOVERY_SECONDS", 60)),
            },
            cache: CacheConfig {
                max_bytes: env_parse("CACHE_MAX_BYTES", 512 * 1024 * 1024),
                redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
                io_timeout: Duration::from_secs(env_parse("CACHE_IO_TIMEOUT_SECONDS", 2)),
                single_flight_timeout: Duration::from_secs(env_parse(
                    "SINGLE_FLIGHT_TIMEOUT_SECONDS",
                    60,
                )),
                ttls,
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5),
                base: Duration::from_millis(env_parse("RETRY_BASE_MS", 200)),
                factor: env_parse("RETRY_FACTOR", 2),
                jitter_pct: env_parse("RETRY_JITTER_PCT", 25),
                max_delay: Duration::from_millis(env_parse("RETRY_MAX_MS", 10_000)),
            },
            batch: BatchConfig {
                default_concurrency: env::var("BATCH_DEFAULT_CONCURRENCY")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| (4 * num_cpus::get()).min(32)),
                retry_attempts: env_parse("BATCH_RETRY_ATTEMPTS", 3),
            },
            analyzer: AnalyzerConfig {
                confidence_threshold: env_parse("CONFIDENCE_THRESHOLD", 0.3),
            },
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.analyzer.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.analyzer.confidence_threshold,
            ));
        }

        if self.cache.max_bytes < 1024 * 1024 {
            return Err(ConfigError::InvalidCacheConfig(format!(
                "cache.max_bytes must be at least 1 MiB, got {}",
                self.cache.max_bytes
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryConfig(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        if self.retry.factor == 0 {
            return Err(ConfigError::InvalidRetryConfig(
                "retry.factor must be > 0".to_string(),
            ));
        }
        if self.retry.jitter_pct > 100 {
            return Err(ConfigError::InvalidRetryConfig(format!(
                "retry.jitter_pct must be <= 100, got {}",
                self.retry.jitter_pct
            )));
        }

        if self.batch.default_concurrency == 0 {
            return Err(ConfigError::InvalidBatchConfig(
                "batch.default_concurrency must be > 0".to_string(),
            ));
        }
        if self.batch.retry_attempts == 0 {
            return Err(ConfigError::InvalidBatchConfig(
                "batch.retry_attempts must be > 0".to_string(),
            ));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidStorageConfig(
                "max_upload_bytes must be > 0".to_string(),
            ));
        }
        match self.storage.mode.as_str() {
            "memory" | "remote" => {}
            other => {
                return Err(ConfigError::InvalidStorageConfig(format!(
                    "STORAGE_MODE must be \"memory\" or \"remote\", got \"{}\"",
                    other
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::load_from_env().unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = base_config();
        config.validate().unwrap();
        assert_eq!(config.storage.similarity_hamming_threshold, 5);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.single_flight_timeout, Duration::from_secs(60));
    }

    #[test]
    fn ttl_table_defaults() {
        let config = base_config();
        assert_eq!(
            config.cache.ttl_for(ResultKind::Extract),
            Duration::from_secs(30 * 24 * 3600)
        );
        assert_eq!(
            config.cache.ttl_for(ResultKind::Batch),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn rejects_bad_confidence() {
        let mut config = base_config();
        config.analyzer.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_cache_budget() {
        let mut config = base_config();
        config.cache.max_bytes = 1024;
        assert!(config.validate().is_err());
    }
}
