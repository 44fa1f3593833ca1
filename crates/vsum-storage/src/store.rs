//! Object store abstraction.

use async_trait::async_trait;

use crate::error::StorageResult;

/// Bucketed blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `bucket/key` and return the object's URL.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Fetch an object. Missing objects are [`StorageError::NotFound`](crate::StorageError::NotFound).
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>>;

    async fn exists(&self, bucket: &str) -> StorageResult<bool>;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()>;
}
