use crate::blob::SpooledBlob;
use crate::config::IngestLimits;
use crate::error::{IngestError, IngestResult};
use crate::metadata::ValidatedBatch;
use crate::naming::StorageKey;
use crate::store::{BlobStore, RecordStore};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Writes a named batch to the object store and the record store.
///
/// The blob goes first and the metadata second. After a failed metadata write
/// the blob is deleted only if this request created it, and never after a
/// timeout, since the write may have committed anyway.
pub struct RemotePersister {
    blob_store: Arc<dyn BlobStore>,
    record_store: Arc<dyn RecordStore>,
    upload_timeout: Duration,
    metadata_timeout: Duration,
}

impl RemotePersister {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
        limits: &IngestLimits,
    ) -> Self {
        Self::with_timeouts(
            blob_store,
            record_store,
            limits.upload_timeout(),
            limits.metadata_timeout(),
        )
    }

    pub fn with_timeouts(
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
        upload_timeout: Duration,
        metadata_timeout: Duration,
    ) -> Self {
        Self {
            blob_store,
            record_store,
            upload_timeout,
            metadata_timeout,
        }
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blob_store
    }

    pub fn record_store(&self) -> &Arc<dyn RecordStore> {
        &self.record_store
    }

    /// Upload the blob, then write its metadata
    #[instrument(skip(self, batch, blob), fields(key = %key, record_count = batch.len()))]
    pub async fn persist(
        &self,
        key: &StorageKey,
        batch: &ValidatedBatch,
        blob: &SpooledBlob,
    ) -> IngestResult<()> {
        let started = Instant::now();
        let existed = self.object_exists(key).await;

        bounded(
            "blob upload",
            self.upload_timeout,
            self.blob_store.put(key, blob),
            IngestError::RemoteBlobUpload,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Blob upload failed, no metadata written");
            metrics::counter!("ingest.remote.upload.failed").increment(1);
            e
        })?;

        metrics::histogram!("ingest.remote.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let written = bounded(
            "metadata write",
            self.metadata_timeout,
            self.record_store.put_batch(&batch.records),
            IngestError::RemoteMetadataWrite,
        )
        .await;

        if let Err(e) = written {
            error!(error = %e, "Blob uploaded but metadata write failed");
            metrics::counter!("ingest.remote.metadata.failed").increment(1);

            if matches!(e, IngestError::RemoteTimeout { .. }) {
                warn!(key = %key, "Metadata write outcome unknown, blob kept");
            } else if existed {
                warn!(key = %key, "Blob replaced an existing object, kept for its earlier records");
            } else {
                self.compensate(key).await;
            }
            return Err(e);
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch persisted remotely"
        );

        Ok(())
    }

    /// Whether an object is already stored under `key`. Unknown counts as present.
    async fn object_exists(&self, key: &StorageKey) -> bool {
        match tokio::time::timeout(self.upload_timeout, self.blob_store.exists(key)).await {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Could not check for an existing blob");
                true
            }
            Err(_) => {
                warn!(key = %key, "Timed out checking for an existing blob");
                true
            }
        }
    }

    /// Remove a blob whose metadata could not be written
    async fn compensate(&self, key: &StorageKey) {
        match tokio::time::timeout(self.upload_timeout, self.blob_store.delete(key)).await {
            Ok(Ok(())) => warn!(key = %key, "Removed blob without metadata"),
            Ok(Err(e)) => {
                error!(
                    key = %key,
                    error = %e,
                    "Failed to remove blob without metadata, blob is orphaned"
                )
            }
            Err(_) => {
                error!(key = %key, "Timed out removing blob without metadata, blob is orphaned")
            }
        }
    }
}

/// Run a remote call under a timeout, mapping both failure kinds
async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
    on_error: fn(String) -> IngestError,
) -> IngestResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(on_error(format!("{:#}", e))),
        Err(_) => Err(IngestError::RemoteTimeout {
            operation,
            elapsed: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::{InMemoryBlobStore, InMemoryRecordStore};
    use crate::metadata::{tests::packet, validate_metadata, MetadataRecord};
    use crate::naming::resolve;
    use crate::store::{MockBlobStore, MockRecordStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use mockall::Sequence;
    use serde_json::json;

    fn batch() -> ValidatedBatch {
        let raw = json!([packet("rpi-01", 1700000000.25), packet("rpi-01", 1700000001.0)]);
        let mut batch = validate_metadata(&raw.to_string()).unwrap();
        let key = resolve(&batch.device_name, batch.earliest_timestamp_ms).unwrap();
        batch.annotate_location(&key.object_key());
        batch
    }

    fn persister(
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
        timeout: Duration,
    ) -> RemotePersister {
        RemotePersister::with_timeouts(blob_store, record_store, timeout, timeout)
    }

    #[tokio::test]
    async fn test_blob_and_records_written() {
        let spool = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let remote = persister(blobs.clone(), records.clone(), Duration::from_secs(5));

        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"0123456789").await.unwrap();

        remote.persist(&key, &batch, &blob).await.unwrap();

        assert_eq!(blobs.get(&key.object_key()).unwrap(), b"0123456789");
        let stored = records.records();
        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .all(|r| r.location.as_deref() == Some(key.object_key().as_str())));
    }

    #[tokio::test]
    async fn test_blob_written_before_metadata() {
        let spool = tempfile::tempdir().unwrap();
        let mut seq = Sequence::new();
        let mut blobs = MockBlobStore::new();
        let mut records = MockRecordStore::new();

        blobs
            .expect_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        blobs
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        records
            .expect_put_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let remote = persister(Arc::new(blobs), Arc::new(records), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        remote.persist(&key, &batch, &blob).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_failure_skips_metadata() {
        let spool = tempfile::tempdir().unwrap();
        let mut blobs = MockBlobStore::new();
        let mut records = MockRecordStore::new();

        blobs.expect_exists().returning(|_| Ok(false));
        blobs
            .expect_put()
            .times(1)
            .returning(|_, _| Err(anyhow!("connection reset")));
        records.expect_put_batch().never();

        let remote = persister(Arc::new(blobs), Arc::new(records), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(
            matches!(err, IngestError::RemoteBlobUpload(ref m) if m.contains("connection reset"))
        );
    }

    #[tokio::test]
    async fn test_metadata_failure_deletes_blob() {
        let spool = tempfile::tempdir().unwrap();
        let mut blobs = MockBlobStore::new();
        let mut records = MockRecordStore::new();

        blobs.expect_exists().returning(|_| Ok(false));
        blobs.expect_put().times(1).returning(|_, _| Ok(()));
        records
            .expect_put_batch()
            .times(1)
            .returning(|_| Err(anyhow!("throughput exceeded")));
        blobs.expect_delete().times(1).returning(|_| Ok(()));

        let remote = persister(Arc::new(blobs), Arc::new(records), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(matches!(err, IngestError::RemoteMetadataWrite(_)));
    }

    #[tokio::test]
    async fn test_metadata_failure_removes_uploaded_blob() {
        let spool = tempfile::tempdir().unwrap();
        let blobs = Arc::new(InMemoryBlobStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        records.set_failing(true);

        let remote = persister(blobs.clone(), records.clone(), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(matches!(err, IngestError::RemoteMetadataWrite(_)));
        assert_eq!(blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_metadata_failure_keeps_replaced_blob() {
        let spool = tempfile::tempdir().unwrap();
        let mut blobs = MockBlobStore::new();
        let mut records = MockRecordStore::new();

        blobs.expect_exists().times(1).returning(|_| Ok(true));
        blobs.expect_put().times(1).returning(|_, _| Ok(()));
        records
            .expect_put_batch()
            .times(1)
            .returning(|_| Err(anyhow!("throughput exceeded")));
        blobs.expect_delete().never();

        let remote = persister(Arc::new(blobs), Arc::new(records), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(matches!(err, IngestError::RemoteMetadataWrite(_)));
    }

    #[tokio::test]
    async fn test_unknown_existing_object_is_not_deleted() {
        let spool = tempfile::tempdir().unwrap();
        let mut blobs = MockBlobStore::new();
        let mut records = MockRecordStore::new();

        blobs
            .expect_exists()
            .times(1)
            .returning(|_| Err(anyhow!("access denied")));
        blobs.expect_put().times(1).returning(|_, _| Ok(()));
        records
            .expect_put_batch()
            .times(1)
            .returning(|_| Err(anyhow!("throughput exceeded")));
        blobs.expect_delete().never();

        let remote = persister(Arc::new(blobs), Arc::new(records), Duration::from_secs(5));
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        remote.persist(&key, &batch, &blob).await.unwrap_err();
    }

    struct StalledRecordStore;

    #[async_trait]
    impl RecordStore for StalledRecordStore {
        async fn put_batch(&self, _records: &[MetadataRecord]) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_metadata_timeout_keeps_blob() {
        let spool = tempfile::tempdir().unwrap();
        let mut blobs = MockBlobStore::new();

        blobs.expect_exists().returning(|_| Ok(false));
        blobs.expect_put().times(1).returning(|_, _| Ok(()));
        blobs.expect_delete().never();

        let remote = RemotePersister::with_timeouts(
            Arc::new(blobs),
            Arc::new(StalledRecordStore),
            Duration::from_secs(5),
            Duration::from_millis(50),
        );
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::RemoteTimeout {
                operation: "metadata write",
                ..
            }
        ));
    }

    struct StalledBlobStore;

    #[async_trait]
    impl BlobStore for StalledBlobStore {
        async fn put(&self, _key: &StorageKey, _blob: &SpooledBlob) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn delete(&self, _key: &StorageKey) -> anyhow::Result<()> {
            Ok(())
        }

        async fn exists(&self, _key: &StorageKey) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_timeout() {
        let spool = tempfile::tempdir().unwrap();
        let records = Arc::new(InMemoryRecordStore::new());
        let remote = persister(
            Arc::new(StalledBlobStore),
            records.clone(),
            Duration::from_millis(50),
        );
        let batch = batch();
        let key = resolve("rpi-01", batch.earliest_timestamp_ms).unwrap();
        let blob = SpooledBlob::from_bytes(spool.path(), b"x").await.unwrap();

        let err = remote.persist(&key, &batch, &blob).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::RemoteTimeout {
                operation: "blob upload",
                ..
            }
        ));
        assert_eq!(records.call_count(), 0);
    }
}
