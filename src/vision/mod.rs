pub mod client;
pub mod types;

// Re-export commonly used items
pub use client::{HttpVisionBackend, VisionBackend, VisionClient};
pub use types::{Feature, PrimitiveBundle};
