pub mod hashing;
pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use hashing::{content_hash, hamming_distance, param_fingerprint, perceptual_hash};
pub use image_ops::{encode_image_async, load_image_from_memory_async};
pub use metrics::Metrics;
