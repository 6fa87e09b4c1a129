use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide metrics collector.
///
/// Tracks uploads, vision usage, cache performance, batch throughput and
/// per-endpoint request counts. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Upload / storage
    uploads_total: AtomicUsize,
    uploads_deduplicated: AtomicUsize,
    bytes_stored: AtomicU64,

    // Vision provider
    vision_calls_total: AtomicUsize,
    vision_calls_failed: AtomicUsize,
    vision_latency_ms: RwLock<Vec<u64>>,

    // Analysis
    analyses_total: AtomicUsize,
    batch_items_total: AtomicUsize,
    batch_items_failed: AtomicUsize,

    // Circuit breaker
    circuit_breaker_trips: AtomicUsize,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                uploads_total: AtomicUsize::new(0),
                uploads_deduplicated: AtomicUsize::new(0),
                bytes_stored: AtomicU64::new(0),
                vision_calls_total: AtomicUsize::new(0),
                vision_calls_failed: AtomicUsize::new(0),
                vision_latency_ms: RwLock::new(Vec::new()),
                analyses_total: AtomicUsize::new(0),
                batch_items_total: AtomicUsize::new(0),
                batch_items_failed: AtomicUsize::new(0),
                circuit_breaker_trips: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_upload(&self, bytes: u64, deduplicated: bool) {
        self.inner.uploads_total.fetch_add(1, Ordering::Relaxed);
        if deduplicated {
            self.inner
                .uploads_deduplicated
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_vision_call(&self, success: bool, duration: Duration) {
        self.inner.vision_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner
                .vision_calls_failed
                .fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .vision_latency_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    pub fn record_analysis(&self) {
        self.inner.analyses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_items(&self, total: usize, failed: usize) {
        self.inner
            .batch_items_total
            .fetch_add(total, Ordering::Relaxed);
        self.inner
            .batch_items_failed
            .fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner
            .circuit_breaker_trips
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.vision_latency_ms.read();
        let vision_latency_avg_ms = avg(&latency);
        let vision_latency_p95_ms = percentile(&latency, 0.95);
        drop(latency);

        let endpoints = self
            .inner
            .endpoint_counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            uploads_total: self.inner.uploads_total.load(Ordering::Relaxed),
            uploads_deduplicated: self.inner.uploads_deduplicated.load(Ordering::Relaxed),
            bytes_stored: self.inner.bytes_stored.load(Ordering::Relaxed),
            vision_calls_total: self.inner.vision_calls_total.load(Ordering::Relaxed),
            vision_calls_failed: self.inner.vision_calls_failed.load(Ordering::Relaxed),
            vision_latency_avg_ms,
            vision_latency_p95_ms,
            analyses_total: self.inner.analyses_total.load(Ordering::Relaxed),
            batch_items_total: self.inner.batch_items_total.load(Ordering::Relaxed),
            batch_items_failed: self.inner.batch_items_failed.load(Ordering::Relaxed),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            endpoints,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP uploads_total Total image uploads received
# TYPE uploads_total counter
uploads_total {}

# HELP uploads_deduplicated_total Uploads collapsed onto an existing record
# TYPE uploads_deduplicated_total counter
uploads_deduplicated_total {}

# HELP bytes_stored_total Bytes written to blob storage
# TYPE bytes_stored_total counter
bytes_stored_total {}

# HELP vision_calls_total Calls made to the vision provider
# TYPE vision_calls_total counter
vision_calls_total {}

# HELP vision_calls_failed_total Failed vision provider calls
# TYPE vision_calls_failed_total counter
vision_calls_failed_total {}

# HELP vision_latency_avg_ms Average vision call latency
# TYPE vision_latency_avg_ms gauge
vision_latency_avg_ms {}

# HELP analyses_total Completed analysis computations
# TYPE analyses_total counter
analyses_total {}

# HELP batch_items_total Batch items processed
# TYPE batch_items_total counter
batch_items_total {}

# HELP batch_items_failed_total Batch items that failed
# TYPE batch_items_failed_total counter
batch_items_failed_total {}

# HELP circuit_breaker_trips_total Circuit breaker open transitions
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            s.uploads_total,
            s.uploads_deduplicated,
            s.bytes_stored,
            s.vision_calls_total,
            s.vision_calls_failed,
            s.vision_latency_avg_ms,
            s.analyses_total,
            s.batch_items_total,
            s.batch_items_failed,
            s.circuit_breaker_trips,
            s.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uploads_total: usize,
    pub uploads_deduplicated: usize,
    pub bytes_stored: u64,
    pub vision_calls_total: usize,
    pub vision_calls_failed: usize,
    pub vision_latency_avg_ms: u64,
    pub vision_latency_p95_ms: u64,
    pub analyses_total: usize,
    pub batch_items_total: usize,
    pub batch_items_failed: usize,
    pub circuit_breaker_trips: usize,
    pub endpoints: std::collections::HashMap<String, usize>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots() {
        let metrics = Metrics::new();

        metrics.record_upload(1000, false);
        metrics.record_upload(1000, true);
        metrics.record_vision_call(true, Duration::from_millis(120));
        metrics.record_vision_call(false, Duration::from_millis(40));
        metrics.record_batch_items(10, 2);
        metrics.record_endpoint_request("analyze");
        metrics.record_endpoint_request("analyze");

        let s = metrics.snapshot();
        assert_eq!(s.uploads_total, 2);
        assert_eq!(s.uploads_deduplicated, 1);
        assert_eq!(s.bytes_stored, 1000);
        assert_eq!(s.vision_calls_total, 2);
        assert_eq!(s.vision_calls_failed, 1);
        assert_eq!(s.batch_items_total, 10);
        assert_eq!(s.batch_items_failed, 2);
        assert_eq!(s.endpoints.get("analyze"), Some(&2));
    }

    #[test]
    fn prometheus_contains_counters() {
        let metrics = Metrics::new();
        metrics.record_vision_call(true, Duration::from_millis(100));
        let text = metrics.to_prometheus();
        assert!(text.contains("vision_calls_total 1"));
        assert!(text.contains("uptime_seconds"));
    }
}
