//! Object storage behind presigned upload URLs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::error::StoreError;
use crate::{StoreResult, DEFAULT_PRESIGN_TTL};

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// A one-shot authorization to upload one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    pub key: String,
    pub content_type: String,

    /// Where to send the bytes.
    pub upload_url: Url,

    /// Where the object can be read once uploaded.
    pub public_url: Url,
}

/// Blob storage reached through presigned URLs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Authorize an upload of `key`.
    async fn presign(&self, key: &str, content_type: &str) -> StoreResult<PresignedUpload>;

    /// Send `body` to a presigned URL in `chunk_bytes` pieces, reporting
    /// progress after each. Returns the public URL.
    async fn put(
        &self,
        upload: &PresignedUpload,
        body: Bytes,
        chunk_bytes: usize,
        progress: ProgressFn<'_>,
    ) -> StoreResult<Url>;
}

/// Presign then put.
#[instrument(name = "object_upload", skip(storage, body, progress), fields(bytes = body.len()))]
pub async fn upload(
    storage: &dyn ObjectStorage,
    key: &str,
    content_type: &str,
    body: Bytes,
    chunk_bytes: usize,
    progress: ProgressFn<'_>,
) -> StoreResult<Url> {
    let presigned = storage.presign(key, content_type).await?;
    let url = storage.put(&presigned, body, chunk_bytes, progress).await?;
    info!(%url, "Object uploaded");
    Ok(url)
}

fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-process [`ObjectStorage`] backend.
pub struct MemoryObjectStorage {
    base_url: Url,
    presign_ttl: Duration,
    objects: Mutex<HashMap<String, StoredObject>>,
    pending: Mutex<HashMap<String, (PresignedUpload, Instant)>>,
    failing_puts: AtomicU32,
}

impl MemoryObjectStorage {
    /// `base_url` must end with `/` for keys to be appended to it.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            presign_ttl: DEFAULT_PRESIGN_TTL,
            objects: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            failing_puts: AtomicU32::new(0),
        }
    }

    /// How long a presigned URL stays usable.
    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }

    /// Make the next `count` puts fail midway.
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|o| o.content_type.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Presigned URLs that have not been used or expired yet.
    pub fn pending_uploads(&self) -> usize {
        let mut pending = self.pending.lock();
        evict_expired(&mut pending);
        pending.len()
    }

    fn join(&self, path: &str) -> StoreResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| StoreError::InvalidKey(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn presign(&self, key: &str, content_type: &str) -> StoreResult<PresignedUpload> {
        validate_key(key)?;

        let mut upload_url = self.join(&format!("upload/{}", key))?;
        upload_url
            .query_pairs_mut()
            .append_pair("signature", &Uuid::new_v4().simple().to_string());

        let presigned = PresignedUpload {
            key: key.to_string(),
            content_type: content_type.to_string(),
            upload_url,
            public_url: self.join(key)?,
        };
        let expires_at = Instant::now() + self.presign_ttl;
        let mut pending = self.pending.lock();
        evict_expired(&mut pending);
        pending.insert(presigned.upload_url.to_string(), (presigned.clone(), expires_at));
        drop(pending);
        debug!(key, content_type, "Upload presigned");
        Ok(presigned)
    }

    async fn put(
        &self,
        upload: &PresignedUpload,
        body: Bytes,
        chunk_bytes: usize,
        progress: ProgressFn<'_>,
    ) -> StoreResult<Url> {
        let presigned = {
            let mut pending = self.pending.lock();
            evict_expired(&mut pending);
            pending.remove(upload.upload_url.as_str())
        }
        .map(|(presigned, _)| presigned)
        .ok_or_else(|| StoreError::Unauthorized(upload.key.clone()))?;

        let should_fail = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let total = body.len() as u64;
        let mut sent = 0u64;
        progress(0, total);
        for chunk in body.chunks(chunk_bytes.max(1)) {
            if should_fail && sent > 0 {
                return Err(StoreError::Upload(format!(
                    "connection reset after {} of {} bytes",
                    sent, total
                )));
            }
            sent += chunk.len() as u64;
            progress(sent, total);
            tokio::task::yield_now().await;
        }
        if should_fail {
            return Err(StoreError::Upload("connection reset".to_string()));
        }

        self.objects.lock().insert(
            presigned.key.clone(),
            StoredObject {
                data: body,
                content_type: presigned.content_type.clone(),
            },
        );
        Ok(presigned.public_url)
    }
}

fn evict_expired(pending: &mut HashMap<String, (PresignedUpload, Instant)>) {
    let now = Instant::now();
    pending.retain(|_, (_, expires_at)| *expires_at > now);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> MemoryObjectStorage {
        MemoryObjectStorage::new(Url::parse("https://cdn.example.com/media/").unwrap())
    }

    #[tokio::test]
    async fn upload_reports_progress_and_returns_public_url() {
        let storage = storage();
        let seen = Mutex::new(Vec::new());
        let progress = |sent: u64, total: u64| seen.lock().push((sent, total));

        let url = upload(
            &storage,
            "recordings/a.webm",
            "video/webm",
            Bytes::from_static(b"0123456789"),
            4,
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(url.as_str(), "https://cdn.example.com/media/recordings/a.webm");
        assert_eq!(
            *seen.lock(),
            vec![(0, 10), (4, 10), (8, 10), (10, 10)]
        );
        assert_eq!(storage.object("recordings/a.webm").unwrap().len(), 10);
        assert_eq!(
            storage.content_type("recordings/a.webm").as_deref(),
            Some("video/webm")
        );
    }

    #[tokio::test]
    async fn presigned_url_is_single_use() {
        let storage = storage();
        let presigned = storage.presign("a.webm", "video/webm").await.unwrap();
        storage
            .put(&presigned, Bytes::from_static(b"x"), 4, &|_, _| {})
            .await
            .unwrap();

        assert!(matches!(
            storage.put(&presigned, Bytes::from_static(b"x"), 4, &|_, _| {}).await,
            Err(StoreError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn failed_put_stores_nothing() {
        let storage = storage();
        storage.fail_next_puts(1);

        let result = upload(
            &storage,
            "b.webm",
            "video/webm",
            Bytes::from_static(b"0123456789"),
            4,
            &|_, _| {},
        )
        .await;

        assert!(matches!(result, Err(StoreError::Upload(_))));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected() {
        let storage = storage();
        for key in ["", "/abs", "a/../b", "a//b"] {
            assert!(matches!(
                storage.presign(key, "video/webm").await,
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn zero_chunk_size_still_uploads() {
        let storage = storage();
        let calls = Mutex::new(0);
        let progress = |_: u64, _: u64| *calls.lock() += 1;

        upload(&storage, "c.webm", "video/webm", Bytes::from_static(b"abc"), 0, &progress)
            .await
            .unwrap();

        assert_eq!(*calls.lock(), 4);
        assert_eq!(storage.object("c.webm").unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unused_presigns_expire() {
        let storage = storage().with_presign_ttl(Duration::from_secs(60));
        let stale = storage.presign("old.webm", "video/webm").await.unwrap();
        assert_eq!(storage.pending_uploads(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        storage.presign("new.webm", "video/webm").await.unwrap();
        assert_eq!(storage.pending_uploads(), 1);

        assert!(matches!(
            storage.put(&stale, Bytes::from_static(b"x"), 4, &|_, _| {}).await,
            Err(StoreError::Unauthorized(_))
        ));
        assert!(storage.object("old.webm").is_none());
    }
}
