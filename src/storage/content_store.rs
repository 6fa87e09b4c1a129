// Content-address store
//
// Uploads are identified by the MD5 of their bytes. Exact duplicates
// collapse onto the existing record; perceptually similar images are stored
// but flagged so the client can disambiguate. Metadata lives in-process
// with a JSON snapshot on disk, rewritten after each mutation.

use crate::core::config::StorageConfig;
use crate::core::errors::{ApiError, ApiResult};
use crate::core::types::{ImageRecord, IngestResult, IngestStatus, SimilarImage};
use crate::storage::blob_store::{image_object_name, BlobStore};
use crate::utils::hashing::{content_hash, hamming_distance, perceptual_hash};
use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct ContentStore {
    records: DashMap<String, ImageRecord>,
    blobs: Arc<dyn BlobStore>,
    config: StorageConfig,
    snapshot_path: PathBuf,
}

impl ContentStore {
    pub async fn new(config: StorageConfig, blobs: Arc<dyn BlobStore>) -> ApiResult<Self> {
        let snapshot_path = PathBuf::from(&config.metadata_path);

        let records = DashMap::new();
        if snapshot_path.exists() {
            let data = tokio::fs::read_to_string(&snapshot_path)
                .await
                .map_err(|e| ApiError::storage(format!("metadata read: {e}"), false))?;
            let loaded: Vec<ImageRecord> = serde_json::from_str(&data).unwrap_or_default();
            info!("loaded {} image records from {:?}", loaded.len(), snapshot_path);
            for record in loaded {
                records.insert(record.image_hash.clone(), record);
            }
        }

        Ok(Self {
            records,
            blobs,
            config,
            snapshot_path,
        })
    }

    fn validate(&self, bytes: &[u8], mime_type: &str) -> ApiResult<()> {
        let mime = mime_type.to_ascii_lowercase();
        if !self.config.allowed_mime_types.iter().any(|m| *m == mime) {
            return Err(ApiError::validation(format!(
                "unsupported media type: {mime_type}"
            )));
        }
        if bytes.len() as u64 > self.config.max_upload_bytes {
            return Err(ApiError::validation(format!(
                "upload of {} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_upload_bytes
            )));
        }
        if bytes.is_empty() {
            return Err(ApiError::validation("empty upload"));
        }
        Ok(())
    }

    /// Ingest an upload: validate, hash, dedup, write blob, commit metadata.
    ///
    /// The blob is written before the record so a storage failure never
    /// leaves metadata pointing at nothing.
    #[instrument(skip(self, bytes), fields(filename = filename, len = bytes.len()))]
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> ApiResult<IngestResult> {
        self.validate(&bytes, mime_type)?;

        let image_hash = content_hash(&bytes);

        // Exact duplicate: return the prior record untouched
        if let Some(existing) = self.records.get(&image_hash) {
            return Ok(IngestResult {
                status: IngestStatus::Duplicate,
                is_duplicate: true,
                record: existing.clone(),
                similar_images: vec![],
            });
        }

        // Decode for dimensions + perceptual signature on the blocking pool
        let decode_bytes = bytes.clone();
        let (width, height, phash) = tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&decode_bytes)
                .map_err(|e| ApiError::validation(format!("image decode failed: {e}")))?;
            let phash = perceptual_hash(&img);
            Ok::<_, ApiError>((img.width(), img.height(), phash))
        })
        .await
        .map_err(|e| ApiError::processing("ingest_decode", e.to_string()))??;

        let similar_images = self.find_similar(&phash, self.config.similarity_hamming_threshold);

        let object_name = image_object_name(&image_hash, &mime_type.to_ascii_lowercase());
        let blob_url = self
            .blobs
            .put(&object_name, bytes.clone(), mime_type)
            .await?;

        let record = ImageRecord {
            image_hash: image_hash.clone(),
            perceptual_hash: phash,
            filename: filename.to_string(),
            size_bytes: bytes.len() as u64,
            mime_type: mime_type.to_ascii_lowercase(),
            blob_url,
            width,
            height,
            upload_time: Utc::now(),
        };
        self.records.insert(image_hash.clone(), record.clone());
        self.persist().await;

        let status = if similar_images.is_empty() {
            IngestStatus::Stored
        } else {
            IngestStatus::Similar
        };

        Ok(IngestResult {
            status,
            is_duplicate: false,
            record,
            similar_images,
        })
    }

    pub fn lookup(&self, image_hash: &str) -> ApiResult<ImageRecord> {
        self.records
            .get(image_hash)
            .map(|r| r.clone())
            .ok_or_else(|| ApiError::image_not_found(image_hash))
    }

    /// Page of records ordered by upload time, newest first.
    pub fn list(
        &self,
        offset: usize,
        limit: usize,
        mime_filter: Option<&str>,
    ) -> (Vec<ImageRecord>, usize) {
        let mut all: Vec<ImageRecord> = self
            .records
            .iter()
            .map(|r| r.clone())
            .filter(|r| mime_filter.map_or(true, |m| r.mime_type == m))
            .collect();
        all.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    /// Records whose perceptual signature is within `max_hamming` bits.
    pub fn find_similar(&self, phash: &str, max_hamming: u32) -> Vec<SimilarImage> {
        let mut matches: Vec<SimilarImage> = self
            .records
            .iter()
            .filter_map(|r| {
                let distance = hamming_distance(phash, &r.perceptual_hash);
                (distance <= max_hamming).then(|| SimilarImage {
                    image_hash: r.image_hash.clone(),
                    perceptual_hash: r.perceptual_hash.clone(),
                    hamming_distance: distance,
                    filename: r.filename.clone(),
                })
            })
            .collect();
        matches.sort_by_key(|m| (m.hamming_distance, m.image_hash.clone()));
        matches
    }

    /// Duplicate check for an already-stored image.
    pub fn check_duplicate(&self, image_hash: &str) -> ApiResult<(bool, Vec<SimilarImage>)> {
        let record = self.lookup(image_hash)?;
        let mut similar =
            self.find_similar(&record.perceptual_hash, self.config.similarity_hamming_threshold);
        similar.retain(|s| s.image_hash != record.image_hash);
        Ok((true, similar))
    }

    /// Remove blob and metadata. Cache entries under the hash are the
    /// coordinator's responsibility.
    #[instrument(skip(self))]
    pub async fn delete(&self, image_hash: &str) -> ApiResult<ImageRecord> {
        let (_, record) = self
            .records
            .remove(image_hash)
            .ok_or_else(|| ApiError::image_not_found(image_hash))?;

        let object_name = image_object_name(&record.image_hash, &record.mime_type);
        if let Err(e) = self.blobs.delete(&object_name).await {
            // Metadata is already gone; an orphaned blob is recoverable,
            // a dangling record is not.
            warn!("blob delete for {} failed: {}", image_hash, e);
        }
        self.persist().await;
        Ok(record)
    }

    /// Fetch original pixels for analysis.
    pub async fn fetch_bytes(&self, image_hash: &str) -> ApiResult<Vec<u8>> {
        let record = self.lookup(image_hash)?;
        let object_name = image_object_name(&record.image_hash, &record.mime_type);
        self.blobs.get(&object_name).await
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size_bytes).sum()
    }

    async fn persist(&self) {
        let records: Vec<ImageRecord> = self.records.iter().map(|r| r.clone()).collect();
        if let Some(parent) = self.snapshot_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_string_pretty(&records) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.snapshot_path, json).await {
                    warn!("metadata snapshot write failed: {e}");
                }
            }
            Err(e) => warn!("metadata snapshot serialize failed: {e}"),
        }
    }
}
