use crate::blob::SpooledBlob;
use crate::config::LocalConfig;
use crate::naming::StorageKey;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Writes blobs into the partition hierarchy on the local filesystem.
///
/// Data is streamed into a hidden temporary file next to the target and
/// renamed into place once complete, so a reader never observes a truncated
/// blob under its final name.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalStore {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            root: config.root.clone(),
            chunk_size: config.chunk_size_bytes,
        }
    }

    /// Final path of the blob stored under `key`
    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.root.join(&key.partition_path).join(&key.file_name)
    }

    /// Copy the blob to its partition directory
    #[instrument(skip(self, blob), fields(key = %key, size_bytes = blob.len()))]
    pub async fn persist(&self, key: &StorageKey, blob: &SpooledBlob) -> io::Result<PathBuf> {
        let dir = self.root.join(&key.partition_path);
        fs::create_dir_all(&dir).await?;

        let target = dir.join(&key.file_name);
        let temp = dir.join(format!(".{}.{}.tmp", key.file_name, Uuid::new_v4()));

        match self.write_then_rename(blob, &temp, &target).await {
            Ok(written) => {
                info!(path = %target.display(), size_bytes = written, "Blob saved locally");
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(
                            path = %temp.display(),
                            error = %cleanup,
                            "Failed to remove partial file"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_then_rename(
        &self,
        blob: &SpooledBlob,
        temp: &Path,
        target: &Path,
    ) -> io::Result<u64> {
        let mut reader = blob.open().await?;
        let mut writer = File::create(temp).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written = 0u64;

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            written += n as u64;
        }

        if written != blob.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copied {} of {} bytes", written, blob.len()),
            ));
        }

        writer.flush().await?;
        writer.sync_all().await?;
        drop(writer);

        fs::rename(temp, target).await?;

        debug!(chunk_size = self.chunk_size, "Local copy complete");
        Ok(written)
    }
}
