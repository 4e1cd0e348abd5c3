use crate::blob::SpooledBlob;
use crate::error::{IngestError, IngestResult};
use crate::key_lock::KeyLocks;
use crate::local_store::LocalStore;
use crate::metadata::validate_metadata;
use crate::naming::StorageKey;
use crate::remote::RemotePersister;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

/// One upload: raw metadata, persistence intents and the spooled blob
#[derive(Debug)]
pub struct IngestRequest {
    /// JSON-encoded metadata array, not yet validated
    pub metadata: String,
    /// Write the blob under the local storage root
    pub save_local: bool,
    /// Write the blob and metadata to the remote stores
    pub save_remote: bool,
    pub blob: SpooledBlob,
}

/// What happened to a successfully ingested batch
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub key: StorageKey,
    pub record_count: usize,
    /// Path of the local copy, if one was written
    pub local_path: Option<PathBuf>,
    pub stored_remotely: bool,
}

/// Pipeline stage a request reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Validated,
    Named,
    LocalPersisted,
    RemotePersisted,
    Completed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Named => "named",
            Self::LocalPersisted => "local_persisted",
            Self::RemotePersisted => "remote_persisted",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Sequences validation, naming and persistence for each request.
///
/// Validation errors abort before anything is written and a local save
/// failure aborts before the remote write. With both flags off the batch is
/// only validated and named.
pub struct Ingestor {
    local: LocalStore,
    remote: RemotePersister,
    key_prefix: String,
    key_locks: KeyLocks,
    permits: Semaphore,
}

impl Ingestor {
    pub fn new(
        local: LocalStore,
        remote: RemotePersister,
        key_prefix: impl Into<String>,
        max_concurrent_ingests: usize,
    ) -> Self {
        Self {
            local,
            remote,
            key_prefix: key_prefix.into(),
            key_locks: KeyLocks::new(),
            permits: Semaphore::new(max_concurrent_ingests),
        }
    }

    /// Remote persister, exposed for readiness checks
    pub fn remote(&self) -> &RemotePersister {
        &self.remote
    }

    /// Ingest one batch
    #[instrument(
        skip(self, request),
        fields(
            save_local = request.save_local,
            save_remote = request.save_remote,
            size_bytes = request.blob.len()
        )
    )]
    pub async fn ingest(&self, request: IngestRequest) -> IngestResult<IngestOutcome> {
        let mut stage = IngestStage::Received;
        let result = self.run(&request, &mut stage).await;

        match &result {
            Ok(outcome) => {
                metrics::counter!("ingest.requests.completed").increment(1);
                metrics::counter!("ingest.bytes.received").increment(request.blob.len());
                info!(
                    file_name = %outcome.key.file_name,
                    record_count = outcome.record_count,
                    "File ingested successfully"
                );
            }
            Err(e) if e.is_client_error() => {
                metrics::counter!("ingest.requests.rejected").increment(1);
                warn!(stage = %stage, error = %e, "Rejected ingest request");
            }
            Err(e) => {
                metrics::counter!("ingest.requests.failed").increment(1);
                error!(stage = %stage, error = %e, "Ingest request failed");
            }
        }

        result
    }

    async fn run(
        &self,
        request: &IngestRequest,
        stage: &mut IngestStage,
    ) -> IngestResult<IngestOutcome> {
        let mut batch = validate_metadata(&request.metadata)?;
        *stage = IngestStage::Validated;

        let key = StorageKey::resolve_with_prefix(
            &self.key_prefix,
            &batch.device_name,
            batch.earliest_timestamp_ms,
        )?;
        batch.annotate_location(&key.object_key());
        *stage = IngestStage::Named;

        debug!(key = %key, record_count = batch.len(), "Batch named");

        let mut outcome = IngestOutcome {
            key,
            record_count: batch.len(),
            local_path: None,
            stored_remotely: false,
        };

        if !request.save_local && !request.save_remote {
            info!(key = %outcome.key, "Dry run, nothing persisted");
            *stage = IngestStage::Completed;
            return Ok(outcome);
        }

        // The semaphore is never closed, so acquiring only waits
        let _permit = self.permits.acquire().await;
        let _key_guard = self.key_locks.lock(&outcome.key).await;

        if request.save_local {
            let path = self
                .local
                .persist(&outcome.key, &request.blob)
                .await
                .map_err(IngestError::LocalIo)?;
            outcome.local_path = Some(path);
            *stage = IngestStage::LocalPersisted;
        }

        if request.save_remote {
            self.remote
                .persist(&outcome.key, &batch, &request.blob)
                .await?;
            outcome.stored_remotely = true;
            *stage = IngestStage::RemotePersisted;
        }

        *stage = IngestStage::Completed;
        Ok(outcome)
    }
}
