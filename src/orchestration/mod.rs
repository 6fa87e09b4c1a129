pub mod batch;
pub mod coordinator;

// Re-export commonly used items
pub use batch::{BatchOrchestrator, CancelToken};
pub use coordinator::Coordinator;
