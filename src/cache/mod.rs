pub mod remote;
pub mod result_cache;
pub mod single_flight;

// Re-export commonly used items
pub use result_cache::{CacheStatsSnapshot, ResultCache};
