//! In-memory object store for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::store::ObjectStore;

#[derive(Default)]
struct State {
    buckets: HashSet<String>,
    objects: HashMap<(String, String), (Vec<u8>, String)>,
}

/// Objects held in a map. Puts into a missing bucket fail like a real server.
#[derive(Clone)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<State>>,
    base_url: String,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            base_url: "memory://objects".to_string(),
        }
    }

    /// Store with `bucket` already created.
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::new();
        store.lock().buckets.insert(bucket.to_string());
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Content type recorded for an object.
    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut state = self.lock();
        if !state.buckets.contains(bucket) {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            (bytes, content_type.to_string()),
        );
        Ok(format!("{}/{}/{}", self.base_url, bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::not_found(format!("{bucket}/{key}")))
    }

    async fn exists(&self, bucket: &str) -> StorageResult<bool> {
        Ok(self.lock().buckets.contains(bucket))
    }

    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        self.lock().buckets.insert(bucket.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_requires_bucket() {
        let store = MemoryObjectStore::new();
        let err = store
            .put("videos", "a.mp4", vec![1], "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(_)));

        store.ensure_bucket("videos").await.unwrap();
        assert!(store.exists("videos").await.unwrap());
        let url = store.put("videos", "a.mp4", vec![1, 2], "video/mp4").await.unwrap();
        assert!(url.ends_with("/videos/a.mp4"));
        assert_eq!(store.get("videos", "a.mp4").await.unwrap(), vec![1, 2]);
        assert_eq!(store.content_type("videos", "a.mp4").as_deref(), Some("video/mp4"));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::with_bucket("videos");
        let err = store.get("videos", "nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert!(!err.is_retryable());
    }
}
