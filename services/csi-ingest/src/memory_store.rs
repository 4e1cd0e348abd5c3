use crate::blob::SpooledBlob;
use crate::metadata::MetadataRecord;
use crate::naming::StorageKey;
use crate::store::{BlobStore, RecordStore};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

/// Blob store keeping objects in a map keyed by object key
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Contents of the object stored under `object_key`
    pub fn get(&self, object_key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(object_key)
            .cloned()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of calls made against the store
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("in-memory blob store is failing");
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &StorageKey, blob: &SpooledBlob) -> Result<()> {
        self.enter()?;

        let mut contents = Vec::with_capacity(blob.len() as usize);
        blob.open()
            .await
            .context("Failed to open spooled blob")?
            .read_to_end(&mut contents)
            .await
            .context("Failed to read spooled blob")?;

        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.object_key(), contents);
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        self.enter()?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key.object_key());
        Ok(())
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        self.enter()?;
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&key.object_key()))
    }

    async fn ping(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("in-memory blob store is failing");
        }
        Ok(())
    }
}

/// Record store appending records to a vector
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<Vec<MetadataRecord>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every record written so far
    pub fn records(&self) -> Vec<MetadataRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of batch writes attempted
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_batch(&self, records: &[MetadataRecord]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("in-memory record store is failing");
        }

        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("in-memory record store is failing");
        }
        Ok(())
    }
}
