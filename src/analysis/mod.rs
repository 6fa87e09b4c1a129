pub mod colors;
pub mod detection;
pub mod nature;
pub mod taxonomy;

// Re-export commonly used items
pub use detection::{detection_artifact, face_artifact};
pub use nature::NatureAnalyzer;
