// Blob store adapter
//
// Wraps the external object store behind a narrow async trait so the
// content store and renderer never see transport details. Object names are
// `images/{hash}.{ext}` for originals and `annotated/{id}.{ext}` for
// rendered downloads.

use crate::core::config::{RetryConfig, StorageConfig};
use crate::core::errors::{ApiError, ApiResult};
use crate::middleware::retry::{classify_reqwest, status_is_transient, RetryPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a blob. Idempotent: putting an existing name is a no-op that
    /// returns the canonical URL.
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> ApiResult<String>;

    async fn get(&self, name: &str) -> ApiResult<Vec<u8>>;

    async fn delete(&self, name: &str) -> ApiResult<()>;

    async fn exists(&self, name: &str) -> ApiResult<bool>;

    /// Canonical public URL for a blob name.
    fn url_for(&self, name: &str) -> String;
}

/// Object name for an original upload.
pub fn image_object_name(image_hash: &str, mime_type: &str) -> String {
    let ext = match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/webp" => "webp",
        _ => "bin",
    };
    format!("images/{image_hash}.{ext}")
}

/// Object name for an annotated render.
pub fn annotated_object_name(annotation_id: &str, ext: &str) -> String {
    format!("annotated/{annotation_id}.{ext}")
}

/// HTTP-backed object store. PUT/GET/DELETE against `{base_url}/{name}`,
/// with the shared retry policy around every call.
pub struct RemoteBlobStore {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl RemoteBlobStore {
    pub fn new(storage: &StorageConfig, retry: &RetryConfig) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ApiError::storage(format!("http client init: {e}"), false))?;

        Ok(Self {
            client,
            base_url: storage.blob_base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(retry),
        })
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn map_status(status: reqwest::StatusCode, name: &str) -> ApiError {
        if status == reqwest::StatusCode::NOT_FOUND {
            ApiError::NotFound {
                resource: format!("blob {name}"),
            }
        } else {
            ApiError::storage(
                format!("object store returned {status} for {name}"),
                status_is_transient(status.as_u16()),
            )
        }
    }
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    #[instrument(skip(self, bytes), fields(name = name, len = bytes.len()))]
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> ApiResult<String> {
        // Existing objects are content-addressed, so a name collision means
        // the bytes are already there.
        if self.exists(name).await.unwrap_or(false) {
            debug!("blob {} already present, skipping write", name);
            return Ok(self.object_url(name));
        }

        let url = self.object_url(name);
        let bytes = Arc::new(bytes);
        let content_type = content_type.to_string();
        self.retry
            .run("blob_put", || {
                let client = self.client.clone();
                let url = url.clone();
                let bytes = Arc::clone(&bytes);
                let content_type = content_type.clone();
                async move {
                    let response = client
                        .put(&url)
                        .header(reqwest::header::CONTENT_TYPE, content_type)
                        .body(bytes.as_ref().clone())
                        .send()
                        .await
                        .map_err(|e| classify_reqwest(&e, "storage"))?;
                    if !response.status().is_success() {
                        return Err(Self::map_status(response.status(), &url));
                    }
                    Ok(())
                }
            })
            .await?;
        Ok(url)
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> ApiResult<Vec<u8>> {
        let url = self.object_url(name);
        self.retry
            .run("blob_get", || {
                let client = self.client.clone();
                let url = url.clone();
                let name = name.to_string();
                async move {
                    let response = client
                        .get(&url)
                        .send()
                        .await
                        .map_err(|e| classify_reqwest(&e, "storage"))?;
                    if !response.status().is_success() {
                        return Err(Self::map_status(response.status(), &name));
                    }
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| classify_reqwest(&e, "storage"))?;
                    Ok(bytes.to_vec())
                }
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> ApiResult<()> {
        let url = self.object_url(name);
        self.retry
            .run("blob_delete", || {
                let client = self.client.clone();
                let url = url.clone();
                let name = name.to_string();
                async move {
                    let response = client
                        .delete(&url)
                        .send()
                        .await
                        .map_err(|e| classify_reqwest(&e, "storage"))?;
                    // Deleting a missing blob is fine
                    if !response.status().is_success()
                        && response.status() != reqwest::StatusCode::NOT_FOUND
                    {
                        return Err(Self::map_status(response.status(), &name));
                    }
                    Ok(())
                }
            })
            .await
    }

    async fn exists(&self, name: &str) -> ApiResult<bool> {
        let url = self.object_url(name);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e, "storage"))?;
        Ok(response.status().is_success())
    }

    fn url_for(&self, name: &str) -> String {
        self.object_url(name)
    }
}

/// In-process blob store for tests and standalone operation.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, (Vec<u8>, String)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> ApiResult<String> {
        self.objects
            .entry(name.to_string())
            .or_insert_with(|| (bytes, content_type.to_string()));
        Ok(self.url_for(name))
    }

    async fn get(&self, name: &str) -> ApiResult<Vec<u8>> {
        self.objects
            .get(name)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| ApiError::NotFound {
                resource: format!("blob {name}"),
            })
    }

    async fn delete(&self, name: &str) -> ApiResult<()> {
        self.objects.remove(name);
        Ok(())
    }

    async fn exists(&self, name: &str) -> ApiResult<bool> {
        Ok(self.objects.contains_key(name))
    }

    fn url_for(&self, name: &str) -> String {
        format!("memory://{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        let url = store
            .put("images/abc.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "memory://images/abc.png");
        assert!(store.exists("images/abc.png").await.unwrap());
        assert_eq!(store.get("images/abc.png").await.unwrap(), vec![1, 2, 3]);

        store.delete("images/abc.png").await.unwrap();
        assert!(!store.exists("images/abc.png").await.unwrap());
        assert!(store.get("images/abc.png").await.is_err());
    }

    #[tokio::test]
    async fn memory_put_is_idempotent() {
        let store = MemoryBlobStore::new();
        store
            .put("images/x.png", vec![1], "image/png")
            .await
            .unwrap();
        // Second put with different bytes keeps the original
        store
            .put("images/x.png", vec![9, 9], "image/png")
            .await
            .unwrap();
        assert_eq!(store.get("images/x.png").await.unwrap(), vec![1]);
        assert_eq!(store.object_count(), 1);
    }

    #[test]
    fn object_names() {
        assert_eq!(
            image_object_name("deadbeef", "image/jpeg"),
            "images/deadbeef.jpg"
        );
        assert_eq!(
            annotated_object_name("a1b2", "png"),
            "annotated/a1b2.png"
        );
    }
}
