// Remote cache tier
//
// A shared key-value store with native TTL, assumed reachable from every
// instance. Every operation is bounded by the cache I/O timeout and fails
// open: a get degrades to a miss, a put becomes a logged no-op. The system
// degrades to uncached correctness, never to incorrect results.

use crate::core::types::ResultKind;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteCache {
    client: redis::Client,
    io_timeout: Duration,
}

impl RemoteCache {
    pub fn new(url: &str, io_timeout: Duration) -> Option<Self> {
        match redis::Client::open(url) {
            Ok(client) => Some(Self { client, io_timeout }),
            Err(e) => {
                warn!("remote cache disabled, bad url: {e}");
                None
            }
        }
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        match tokio::time::timeout(
            self.io_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Some(conn),
            Ok(Err(e)) => {
                debug!("remote cache connect failed: {e}");
                None
            }
            Err(_) => {
                debug!("remote cache connect timed out");
                None
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.connection().await?;
        match tokio::time::timeout(self.io_timeout, conn.get::<_, Option<Vec<u8>>>(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                debug!("remote cache get {key} failed: {e}");
                None
            }
            Err(_) => {
                debug!("remote cache get {key} timed out");
                None
            }
        }
    }

    /// Best-effort write with TTL. Failures are logged and swallowed.
    pub async fn put(&self, key: &str, value: &[u8], ttl: Duration) {
        let Some(mut conn) = self.connection().await else {
            warn!("remote cache put {key} skipped: no connection");
            return;
        };
        let ttl_secs = ttl.as_secs().max(1);
        match tokio::time::timeout(
            self.io_timeout,
            conn.set_ex::<_, _, ()>(key, value, ttl_secs),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("remote cache put {key} failed: {e}"),
            Err(_) => warn!("remote cache put {key} timed out"),
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(mut conn) = self.connection().await {
            let _ = tokio::time::timeout(self.io_timeout, conn.del::<_, ()>(key)).await;
        }
    }

    /// Delete all keys matching a glob pattern. Returns deleted count.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let Some(mut conn) = self.connection().await else {
            return 0;
        };
        let keys: Vec<String> = match tokio::time::timeout(
            self.io_timeout,
            conn.keys::<_, Vec<String>>(pattern),
        )
        .await
        {
            Ok(Ok(keys)) => keys,
            _ => return 0,
        };
        if keys.is_empty() {
            return 0;
        }
        let count = keys.len();
        match tokio::time::timeout(self.io_timeout, conn.del::<_, ()>(keys)).await {
            Ok(Ok(())) => count,
            _ => 0,
        }
    }

    /// Read the mirrored version counter for a kind, if present.
    pub async fn get_version(&self, kind: ResultKind) -> Option<u64> {
        let raw = self.get(&format!("version:{}", kind.prefix())).await?;
        std::str::from_utf8(&raw).ok()?.parse().ok()
    }

    /// Mirror a version counter. Monotonic: only writes values greater than
    /// what the store already holds.
    pub async fn set_version(&self, kind: ResultKind, version: u64) {
        let key = format!("version:{}", kind.prefix());
        let current = self.get_version(kind).await.unwrap_or(0);
        if version > current {
            if let Some(mut conn) = self.connection().await {
                let _ = tokio::time::timeout(
                    self.io_timeout,
                    conn.set::<_, _, ()>(&key, version.to_string()),
                )
                .await;
            }
        }
    }
}
