use crate::blob::SpooledBlob;
use crate::metadata::MetadataRecord;
use crate::naming::StorageKey;
use anyhow::Result;
use async_trait::async_trait;

/// Object storage for CSI blobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the blob under the key's object key, replacing any existing object
    async fn put(&self, key: &StorageKey, blob: &SpooledBlob) -> Result<()>;

    /// Remove the object stored under the key
    async fn delete(&self, key: &StorageKey) -> Result<()>;

    /// Check whether an object exists under the key
    async fn exists(&self, key: &StorageKey) -> Result<bool>;

    /// Verify the store is reachable
    async fn ping(&self) -> Result<()>;
}

/// Queryable storage for per-message metadata
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write every record of a batch
    async fn put_batch(&self, records: &[MetadataRecord]) -> Result<()>;

    /// Verify the store is reachable
    async fn ping(&self) -> Result<()>;
}
