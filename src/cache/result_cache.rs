// Tiered result cache
//
// Layout: an in-process tier for sub-millisecond reads of hot keys, backed
// by an optional shared remote tier with native TTL. Keys embed a per-kind
// version counter, so bumping the version atomically invalidates every
// older entry without scanning the keyspace.
//
// Key encoding: "{kind}:v{version}:{image_hash}:{param_fingerprint}"
//
// Eviction under memory pressure is score-based rather than pure LRU:
//   score = 0.3 * (remaining_ttl / initial_ttl)
//         + 0.4 * kind_weight
//         + 0.3 * normalized_recency
// Lowest scores go first, until usage falls to 80% of the budget. Expensive
// kinds (extract, segment) carry the highest weights so cheap-to-recompute
// entries are sacrificed ahead of them.

use crate::cache::remote::RemoteCache;
use crate::cache::single_flight::{FlightGroup, Join};
use crate::core::config::CacheConfig;
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{AnalysisArtifact, ResultKind};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

const W_TTL: f64 = 0.3;
const W_KIND: f64 = 0.4;
const W_RECENCY: f64 = 0.3;

/// Relative protection under eviction pressure. Expensive-to-recompute
/// kinds score highest.
fn kind_weight(kind: ResultKind) -> f64 {
    match kind {
        ResultKind::Extract => 1.0,
        ResultKind::Segment => 0.9,
        ResultKind::Nature => 0.6,
        ResultKind::Annotate => 0.5,
        ResultKind::Detect | ResultKind::Faces => 0.4,
        ResultKind::Batch => 0.1,
    }
}

/// Serialized cache payload, shared between tiers. Carrying computed_at and
/// ttl inside the value keeps expiry honest when an entry is hydrated back
/// from the remote tier.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    artifact: AnalysisArtifact,
    computed_at_ms: u64,
    ttl_ms: u64,
    version: u64,
    fingerprint: String,
}

struct LocalEntry {
    artifact: Arc<AnalysisArtifact>,
    bytes_len: usize,
    kind: ResultKind,
    computed_at_ms: u64,
    ttl: Duration,
    last_access: Instant,
}

impl LocalEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.computed_at_ms) > self.ttl.as_millis() as u64
    }

    fn remaining_ratio(&self, now_ms: u64) -> f64 {
        let ttl_ms = self.ttl.as_millis() as f64;
        if ttl_ms <= 0.0 {
            return 0.0;
        }
        let age = now_ms.saturating_sub(self.computed_at_ms) as f64;
        ((ttl_ms - age) / ttl_ms).clamp(0.0, 1.0)
    }
}

struct LocalTier {
    map: LruCache<String, LocalEntry>,
    total_bytes: usize,
}

#[derive(Default)]
struct KindCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    evicted_bytes: AtomicU64,
    expirations: AtomicUsize,
    per_kind: HashMap<ResultKind, KindCounters>,
}

impl Stats {
    fn new() -> Self {
        Self {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            evicted_bytes: AtomicU64::new(0),
            expirations: AtomicUsize::new(0),
            per_kind: ResultKind::ALL
                .iter()
                .map(|k| (*k, KindCounters::default()))
                .collect(),
        }
    }

    fn record_hit(&self, kind: ResultKind) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.per_kind.get(&kind) {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_miss(&self, kind: ResultKind) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.per_kind.get(&kind) {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KindStatsSnapshot {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub evicted_bytes: u64,
    pub expirations: usize,
    pub entries: usize,
    pub bytes: usize,
    pub hit_rate: f64,
    pub remote_tier_enabled: bool,
    pub per_kind: HashMap<String, KindStatsSnapshot>,
    pub versions: HashMap<String, u64>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ResultCache {
    config: CacheConfig,
    local: Mutex<LocalTier>,
    remote: Option<RemoteCache>,
    versions: HashMap<ResultKind, AtomicU64>,
    flights: FlightGroup<Arc<AnalysisArtifact>>,
    stats: Stats,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let remote = config
            .redis_url
            .as_deref()
            .and_then(|url| RemoteCache::new(url, config.io_timeout));
        if remote.is_some() {
            info!("result cache: remote tier enabled");
        } else {
            info!("result cache: local tier only");
        }

        Self {
            config,
            local: Mutex::new(LocalTier {
                map: LruCache::unbounded(),
                total_bytes: 0,
            }),
            remote,
            versions: ResultKind::ALL
                .iter()
                .map(|k| (*k, AtomicU64::new(1)))
                .collect(),
            flights: FlightGroup::new(),
            stats: Stats::new(),
        }
    }

    /// Pull mirrored version counters from the remote tier so restarted or
    /// sibling instances converge on the same key namespace.
    pub async fn sync_versions(&self) {
        let Some(remote) = &self.remote else { return };
        for kind in ResultKind::ALL {
            if let Some(version) = remote.get_version(kind).await {
                let counter = &self.versions[&kind];
                let local = counter.load(Ordering::SeqCst);
                if version > local {
                    counter.store(version, Ordering::SeqCst);
                }
            }
        }
    }

    pub fn current_version(&self, kind: ResultKind) -> u64 {
        self.versions[&kind].load(Ordering::SeqCst)
    }

    pub fn encode_key(&self, kind: ResultKind, image_hash: &str, fingerprint: &str) -> String {
        format!(
            "{}:v{}:{}:{}",
            kind.prefix(),
            self.current_version(kind),
            image_hash,
            fingerprint
        )
    }

    /// Look up one entry. Expired entries read as a miss everywhere.
    pub async fn get(
        &self,
        kind: ResultKind,
        image_hash: &str,
        fingerprint: &str,
    ) -> Option<Arc<AnalysisArtifact>> {
        let key = self.encode_key(kind, image_hash, fingerprint);
        let now = now_ms();

        {
            let mut tier = self.local.lock();
            if let Some(entry) = tier.map.get_mut(&key) {
                if entry.is_expired(now) {
                    let size = entry.bytes_len;
                    tier.map.pop(&key);
                    tier.total_bytes = tier.total_bytes.saturating_sub(size);
                    self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                } else {
                    entry.last_access = Instant::now();
                    let artifact = Arc::clone(&entry.artifact);
                    drop(tier);
                    self.stats.record_hit(kind);
                    return Some(artifact);
                }
            }
        }

        // Local miss: consult the remote tier and hydrate on success.
        if let Some(remote) = &self.remote {
            if let Some(bytes) = remote.get(&key).await {
                if let Ok(stored) = serde_json::from_slice::<StoredEntry>(&bytes) {
                    let live = now.saturating_sub(stored.computed_at_ms) <= stored.ttl_ms;
                    if live {
                        let artifact = Arc::new(stored.artifact);
                        self.insert_local(
                            &key,
                            kind,
                            Arc::clone(&artifact),
                            bytes.len(),
                            stored.computed_at_ms,
                            Duration::from_millis(stored.ttl_ms),
                        );
                        self.stats.record_hit(kind);
                        return Some(artifact);
                    }
                }
            }
        }

        self.stats.record_miss(kind);
        None
    }

    /// Store a computed artifact under the current version of its kind.
    #[instrument(skip(self, artifact))]
    pub async fn put(
        &self,
        kind: ResultKind,
        image_hash: &str,
        fingerprint: &str,
        artifact: Arc<AnalysisArtifact>,
        ttl_override: Option<Duration>,
    ) {
        let ttl = ttl_override.unwrap_or_else(|| self.config.ttl_for(kind));
        let key = self.encode_key(kind, image_hash, fingerprint);
        let computed_at_ms = now_ms();

        let stored = StoredEntry {
            artifact: (*artifact).clone(),
            computed_at_ms,
            ttl_ms: ttl.as_millis() as u64,
            version: self.current_version(kind),
            fingerprint: fingerprint.to_string(),
        };
        let bytes = match serde_json::to_vec(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                // CacheError is never fatal; the artifact simply goes uncached.
                warn!("cache serialize failed for {key}: {e}");
                return;
            }
        };

        self.insert_local(&key, kind, artifact, bytes.len(), computed_at_ms, ttl);

        if let Some(remote) = &self.remote {
            remote.put(&key, &bytes, ttl).await;
        }
    }

    fn insert_local(
        &self,
        key: &str,
        kind: ResultKind,
        artifact: Arc<AnalysisArtifact>,
        bytes_len: usize,
        computed_at_ms: u64,
        ttl: Duration,
    ) {
        let mut tier = self.local.lock();
        if let Some(old) = tier.map.pop(key) {
            tier.total_bytes = tier.total_bytes.saturating_sub(old.bytes_len);
        }
        tier.map.put(
            key.to_string(),
            LocalEntry {
                artifact,
                bytes_len,
                kind,
                computed_at_ms,
                ttl,
                last_access: Instant::now(),
            },
        );
        tier.total_bytes += bytes_len;
        self.evict_if_needed(&mut tier);
    }

    /// Score-based eviction down to 80% of the byte budget.
    fn evict_if_needed(&self, tier: &mut LocalTier) {
        let max = self.config.max_bytes as usize;
        if tier.total_bytes <= max {
            return;
        }
        let target = max * 8 / 10;
        let now = now_ms();
        let len = tier.map.len();

        // LruCache iterates most-recent first, which gives the recency rank
        // without tracking another index.
        let mut scored: Vec<(String, usize, f64)> = tier
            .map
            .iter()
            .enumerate()
            .map(|(rank, (key, entry))| {
                let recency = if len <= 1 {
                    1.0
                } else {
                    1.0 - rank as f64 / (len - 1) as f64
                };
                let score = W_TTL * entry.remaining_ratio(now)
                    + W_KIND * kind_weight(entry.kind)
                    + W_RECENCY * recency;
                (key.clone(), entry.bytes_len, score)
            })
            .collect();
        scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0usize;
        let mut freed = 0u64;
        for (key, size, _score) in scored {
            if tier.total_bytes <= target {
                break;
            }
            if tier.map.pop(&key).is_some() {
                tier.total_bytes = tier.total_bytes.saturating_sub(size);
                evicted += 1;
                freed += size as u64;
            }
        }
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
            self.stats.evicted_bytes.fetch_add(freed, Ordering::Relaxed);
            debug!(
                "cache pressure: evicted {} entries ({} bytes), {} bytes in use",
                evicted, freed, tier.total_bytes
            );
        }
    }

    /// Refresh the recency of an entry without reading it.
    pub fn touch(&self, kind: ResultKind, image_hash: &str, fingerprint: &str) {
        let key = self.encode_key(kind, image_hash, fingerprint);
        let mut tier = self.local.lock();
        if let Some(entry) = tier.map.get_mut(&key) {
            entry.last_access = Instant::now();
        }
    }

    /// Bump the kind's version counter. Every existing entry of that kind
    /// becomes unreachable in one step; storage is reclaimed lazily by TTL
    /// and cleanup.
    pub async fn invalidate_version(&self, kind: ResultKind) -> u64 {
        let version = self.versions[&kind].fetch_add(1, Ordering::SeqCst) + 1;
        info!("cache version bump: {} -> v{}", kind.prefix(), version);
        if let Some(remote) = &self.remote {
            remote.set_version(kind, version).await;
        }
        version
    }

    /// Compute-once semantics per key: concurrent callers for the same key
    /// share one computation and its outcome. Errors are never cached, so
    /// the next caller after a failure recomputes. Waiters give up after
    /// the single-flight timeout while the computation itself keeps going.
    ///
    /// Returns the artifact and whether it came from cache (or a coalesced
    /// in-flight computation) rather than a fresh compute.
    pub async fn get_or_compute<F, Fut>(
        &self,
        kind: ResultKind,
        image_hash: &str,
        fingerprint: &str,
        ttl_override: Option<Duration>,
        compute: F,
    ) -> ApiResult<(Arc<AnalysisArtifact>, bool)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ApiResult<AnalysisArtifact>>,
    {
        loop {
            if let Some(hit) = self.get(kind, image_hash, fingerprint).await {
                return Ok((hit, true));
            }

            let key = self.encode_key(kind, image_hash, fingerprint);
            match self.flights.join(&key) {
                Join::Leader(leader) => {
                    let result = compute().await.map(Arc::new);
                    if let Ok(artifact) = &result {
                        self.put(
                            kind,
                            image_hash,
                            fingerprint,
                            Arc::clone(artifact),
                            ttl_override,
                        )
                        .await;
                    }
                    leader.complete(result.clone());
                    return result.map(|artifact| (artifact, false));
                }
                Join::Waiter(flight) => {
                    match flight.wait(self.config.single_flight_timeout).await {
                        Ok(Some(result)) => return result.map(|artifact| (artifact, true)),
                        // Leader was cancelled; re-check the cache and race
                        // to become the new leader.
                        Ok(None) => continue,
                        Err(()) => {
                            return Err(ApiError::timeout(format!(
                                "single-flight wait for {key}"
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Drop every cached entry for one image across all kinds and versions.
    pub async fn clear_hash(&self, image_hash: &str) -> usize {
        let needle = format!(":{image_hash}:");
        let mut removed = 0;
        {
            let mut tier = self.local.lock();
            let keys: Vec<String> = tier
                .map
                .iter()
                .filter(|(k, _)| k.contains(&needle))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(entry) = tier.map.pop(&key) {
                    tier.total_bytes = tier.total_bytes.saturating_sub(entry.bytes_len);
                    removed += 1;
                }
            }
        }
        if let Some(remote) = &self.remote {
            removed += remote.delete_pattern(&format!("*:{image_hash}:*")).await;
        }
        removed
    }

    /// Drop everything in the local tier.
    pub async fn clear_all(&self) -> usize {
        let mut tier = self.local.lock();
        let removed = tier.map.len();
        tier.map.clear();
        tier.total_bytes = 0;
        removed
    }

    /// Purge expired local entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = now_ms();
        let mut tier = self.local.lock();
        let expired: Vec<String> = tier
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some(entry) = tier.map.pop(&key) {
                tier.total_bytes = tier.total_bytes.saturating_sub(entry.bytes_len);
            }
        }
        if count > 0 {
            self.stats.expirations.fetch_add(count, Ordering::Relaxed);
        }
        count
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let (entries, bytes, per_kind_usage) = {
            let tier = self.local.lock();
            let mut usage: HashMap<ResultKind, (usize, usize)> = HashMap::new();
            for (_, entry) in tier.map.iter() {
                let slot = usage.entry(entry.kind).or_default();
                slot.0 += 1;
                slot.1 += entry.bytes_len;
            }
            (tier.map.len(), tier.total_bytes, usage)
        };

        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let per_kind = ResultKind::ALL
            .iter()
            .map(|kind| {
                let counters = &self.stats.per_kind[kind];
                let (entries, bytes) = per_kind_usage.get(kind).copied().unwrap_or((0, 0));
                (
                    kind.prefix().to_string(),
                    KindStatsSnapshot {
                        hits: counters.hits.load(Ordering::Relaxed),
                        misses: counters.misses.load(Ordering::Relaxed),
                        entries,
                        bytes,
                    },
                )
            })
            .collect();

        let versions = ResultKind::ALL
            .iter()
            .map(|kind| (kind.prefix().to_string(), self.current_version(*kind)))
            .collect();

        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.stats.evicted_bytes.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            entries,
            bytes,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            remote_tier_enabled: self.remote.is_some(),
            per_kind,
            versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DetectionArtifact, FaceArtifact};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> CacheConfig {
        CacheConfig {
            max_bytes: 512 * 1024 * 1024,
            redis_url: None,
            io_timeout: Duration::from_secs(2),
            single_flight_timeout: Duration::from_secs(5),
            ttls: {
                let mut ttls = HashMap::new();
                for kind in ResultKind::ALL {
                    ttls.insert(kind, Duration::from_secs(3600));
                }
                ttls
            },
        }
    }

    fn detect_artifact(n: usize) -> AnalysisArtifact {
        AnalysisArtifact::Detect(DetectionArtifact {
            detections: vec![],
            labels: (0..n)
                .map(|i| crate::core::types::LabelAnnotation {
                    description: format!("label-{i}"),
                    confidence: 0.9,
                    topicality: 0.9,
                })
                .collect(),
            safe_search: None,
            enabled: true,
        })
    }

    fn faces_artifact() -> AnalysisArtifact {
        AnalysisArtifact::Faces(FaceArtifact {
            faces: vec![],
            total_faces: 0,
            enabled: true,
        })
    }

    #[tokio::test]
    async fn put_get_round_trip_and_stats() {
        let cache = ResultCache::new(test_config());

        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_none());
        cache
            .put(
                ResultKind::Detect,
                "h1",
                "fp",
                Arc::new(detect_artifact(2)),
                None,
            )
            .await;
        let hit = cache.get(ResultKind::Detect, "h1", "fp").await.unwrap();
        assert_eq!(hit.kind(), ResultKind::Detect);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.bytes > 0);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.per_kind["detect"].hits, 1);
    }

    #[tokio::test]
    async fn different_fingerprints_are_separate_entries() {
        let cache = ResultCache::new(test_config());
        cache
            .put(ResultKind::Detect, "h1", "fp_a", Arc::new(detect_artifact(1)), None)
            .await;
        assert!(cache.get(ResultKind::Detect, "h1", "fp_b").await.is_none());
        assert!(cache.get(ResultKind::Detect, "h1", "fp_a").await.is_some());
    }

    #[tokio::test]
    async fn ttl_expiry_reads_as_miss() {
        let cache = ResultCache::new(test_config());
        cache
            .put(
                ResultKind::Detect,
                "h1",
                "fp",
                Arc::new(detect_artifact(1)),
                Some(Duration::from_millis(40)),
            )
            .await;
        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_none());
        assert!(cache.stats().expirations >= 1);
    }

    #[tokio::test]
    async fn version_bump_invalidates_prior_entries() {
        let cache = ResultCache::new(test_config());
        cache
            .put(ResultKind::Detect, "h1", "fp", Arc::new(detect_artifact(1)), None)
            .await;
        cache
            .put(ResultKind::Faces, "h1", "fp", Arc::new(faces_artifact()), None)
            .await;

        let v = cache.invalidate_version(ResultKind::Detect).await;
        assert_eq!(v, 2);
        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_none());
        // Other kinds are untouched
        assert!(cache.get(ResultKind::Faces, "h1", "fp").await.is_some());

        // A fresh put lands under the new version and is reachable
        cache
            .put(ResultKind::Detect, "h1", "fp", Arc::new(detect_artifact(1)), None)
            .await;
        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_some());
    }

    #[tokio::test]
    async fn single_flight_collapses_concurrent_computes() {
        let cache = Arc::new(ResultCache::new(test_config()));
        let computations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let computations = Arc::clone(&computations);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(ResultKind::Detect, "h1", "fp", None, || {
                        let computations = Arc::clone(&computations);
                        async move {
                            computations.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok(detect_artifact(1))
                        }
                    })
                    .await
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            let (artifact, from_cache) = handle.await.unwrap().unwrap();
            assert_eq!(artifact.kind(), ResultKind::Detect);
            if !from_cache {
                fresh += 1;
            }
        }

        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = ResultCache::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls1 = Arc::clone(&calls);
        let first = cache
            .get_or_compute(ResultKind::Detect, "h1", "fp", None, move || {
                let calls = Arc::clone(&calls1);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::vision("503", true))
                }
            })
            .await;
        assert!(first.is_err());

        let calls2 = Arc::clone(&calls);
        let second = cache
            .get_or_compute(ResultKind::Detect, "h1", "fp", None, move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(detect_artifact(1))
                }
            })
            .await;
        let (_, from_cache) = second.unwrap();
        assert!(!from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn byte_budget_is_enforced_with_kind_protection() {
        let mut config = test_config();
        config.max_bytes = 8 * 1024;
        let cache = ResultCache::new(config);

        // Protected entry first: an expensive extract-kind artifact
        cache
            .put(ResultKind::Extract, "hx", "fp", Arc::new(detect_artifact(4)), None)
            .await;
        // Flood with short-lived batch entries until pressure triggers
        for i in 0..64 {
            cache
                .put(
                    ResultKind::Batch,
                    &format!("h{i}"),
                    "fp",
                    Arc::new(detect_artifact(8)),
                    None,
                )
                .await;
        }

        let stats = cache.stats();
        assert!(stats.bytes <= 8 * 1024, "usage {} over budget", stats.bytes);
        assert!(stats.evictions > 0);
        assert!(stats.evicted_bytes > 0);
        // The high-weight entry outlived the flood
        assert!(cache.get(ResultKind::Extract, "hx", "fp").await.is_some());
    }

    #[tokio::test]
    async fn clear_hash_removes_all_kinds_for_image() {
        let cache = ResultCache::new(test_config());
        cache
            .put(ResultKind::Detect, "h1", "fp", Arc::new(detect_artifact(1)), None)
            .await;
        cache
            .put(ResultKind::Faces, "h1", "fp", Arc::new(faces_artifact()), None)
            .await;
        cache
            .put(ResultKind::Detect, "h2", "fp", Arc::new(detect_artifact(1)), None)
            .await;

        let removed = cache.clear_hash("h1").await;
        assert_eq!(removed, 2);
        assert!(cache.get(ResultKind::Detect, "h1", "fp").await.is_none());
        assert!(cache.get(ResultKind::Detect, "h2", "fp").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_purges_expired_entries() {
        let cache = ResultCache::new(test_config());
        cache
            .put(
                ResultKind::Detect,
                "h1",
                "fp",
                Arc::new(detect_artifact(1)),
                Some(Duration::from_millis(20)),
            )
            .await;
        cache
            .put(ResultKind::Detect, "h2", "fp", Arc::new(detect_artifact(1)), None)
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn key_encoding_shape() {
        let cache = ResultCache::new(test_config());
        let key = cache.encode_key(ResultKind::Nature, "abcdef", "0011223344556677");
        assert_eq!(key, "nature:v1:abcdef:0011223344556677");
    }
}
