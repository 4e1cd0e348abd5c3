use crate::error::{IngestError, IngestResult};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Removes the spool file on drop
#[derive(Debug)]
struct SpoolFile {
    path: PathBuf,
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove spool file");
            }
        }
    }
}

/// Incrementally writes an incoming blob to the spool directory
pub struct BlobSpooler {
    file: File,
    spool: SpoolFile,
    written: u64,
    limit: u64,
}

impl BlobSpooler {
    /// Create a new spool file in `dir` that accepts at most `limit` bytes
    pub async fn create(dir: &Path, limit: u64) -> IngestResult<Self> {
        fs::create_dir_all(dir).await.map_err(IngestError::Spool)?;

        let path = dir.join(format!("upload-{}.part", Uuid::new_v4()));
        let file = File::create(&path).await.map_err(IngestError::Spool)?;

        Ok(Self {
            file,
            spool: SpoolFile { path },
            written: 0,
            limit,
        })
    }

    /// Append a chunk, failing once the blob grows past the limit
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> IngestResult<()> {
        let written = self.written + chunk.len() as u64;
        if written > self.limit {
            return Err(IngestError::BlobTooLarge { limit: self.limit });
        }

        self.file.write_all(chunk).await.map_err(IngestError::Spool)?;
        self.written = written;
        Ok(())
    }

    /// Flush to disk and hand back a readable blob
    pub async fn finish(mut self) -> IngestResult<SpooledBlob> {
        self.file.flush().await.map_err(IngestError::Spool)?;
        self.file.sync_data().await.map_err(IngestError::Spool)?;

        debug!(
            path = %self.spool.path.display(),
            size_bytes = self.written,
            "Blob spooled"
        );

        Ok(SpooledBlob {
            spool: self.spool,
            len: self.written,
        })
    }
}

/// A fully received blob that can be read any number of times
#[derive(Debug)]
pub struct SpooledBlob {
    spool: SpoolFile,
    len: u64,
}

impl SpooledBlob {
    /// Spool an in-memory buffer
    pub async fn from_bytes(dir: &Path, bytes: &[u8]) -> IngestResult<Self> {
        let mut spooler = BlobSpooler::create(dir, u64::MAX).await?;
        spooler.write_chunk(bytes).await?;
        spooler.finish().await
    }

    /// Open a fresh reader positioned at the start of the blob
    pub async fn open(&self) -> std::io::Result<File> {
        File::open(&self.spool.path).await
    }

    /// Size of the blob in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Location of the spool file
    pub fn path(&self) -> &Path {
        &self.spool.path
    }
}
