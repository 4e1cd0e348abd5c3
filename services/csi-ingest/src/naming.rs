use crate::error::{IngestError, IngestResult};
use chrono::{DateTime, Utc};
use std::fmt;

/// Root segment used when no prefix is configured
pub const DEFAULT_KEY_PREFIX: &str = "csi-data";

/// Where a blob lives: partition directory plus file name, in UTC:
/// `{prefix}/{device}/{YYYY}/{MM}/{DD}_{HH}/{mm}/{device}_{YYYY}_{MM}_{DD}_{HH}_{mm}_{ss}.bin`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    /// Partition directory, always ending in `/`
    pub partition_path: String,
    /// Blob file name
    pub file_name: String,
}

impl StorageKey {
    /// Resolve the key for a batch under the given root prefix
    pub fn resolve_with_prefix(
        prefix: &str,
        device_name: &str,
        earliest_timestamp_ms: i64,
    ) -> IngestResult<Self> {
        let dt: DateTime<Utc> = DateTime::from_timestamp_millis(earliest_timestamp_ms)
            .ok_or(IngestError::InvalidTimestamp(earliest_timestamp_ms))?;

        let file_name = format!(
            "{device}_{stamp}.bin",
            device = device_name,
            stamp = dt.format("%Y_%m_%d_%H_%M_%S"),
        );

        let partition_path = format!(
            "{prefix}/{device}/{bucket}/",
            prefix = prefix,
            device = device_name,
            bucket = dt.format("%Y/%m/%d_%H/%M"),
        );

        Ok(Self {
            partition_path,
            file_name,
        })
    }

    /// Partition path and file name joined, used as the object key
    pub fn object_key(&self) -> String {
        format!("{}{}", self.partition_path, self.file_name)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.partition_path, self.file_name)
    }
}

/// Resolve the key for a batch under [`DEFAULT_KEY_PREFIX`]
pub fn resolve(device_name: &str, earliest_timestamp_ms: i64) -> IngestResult<StorageKey> {
    StorageKey::resolve_with_prefix(DEFAULT_KEY_PREFIX, device_name, earliest_timestamp_ms)
}
