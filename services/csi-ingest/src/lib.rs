//! WiROS CSI Ingest Service
//!
//! HTTP ingest endpoint for WiFi Channel State Information captured by WiROS
//! sensor devices. Each request carries a binary blob of concatenated CSI
//! messages together with a JSON array describing every message in it. The
//! service validates the metadata, derives a deterministic storage name from
//! the device and the earliest capture time, and persists the blob locally,
//! remotely, or both.
//!
//! ## Features
//!
//! - **Strict Metadata Validation**: every record is checked before anything
//!   is written, so a rejected request leaves no trace
//! - **Deterministic Naming**: `{prefix}/{device}/{YYYY}/{MM}/{DD}_{HH}/{mm}/`
//!   partitions with second-resolution file names, always in UTC
//! - **Atomic Local Writes**: blobs are staged and renamed into place
//! - **Ordered Remote Persistence**: blob to S3 first, metadata to PostgreSQL
//!   second, with the blob removed again if the metadata write fails
//!
//! ## Architecture
//!
//! ```text
//!  multipart POST /ingest
//! ┌──────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ API          │─────▶│ Metadata     │─────▶│ Naming       │
//! │ (spool blob) │      │ Validation   │      │              │
//! └──────────────┘      └──────────────┘      └──────────────┘
//!                                                    │
//!                                                    ▼
//!                                             ┌──────────────┐
//!                                             │ Ingestor     │
//!                                             │ (key lock)   │
//!                                             └──────────────┘
//!                                              │           │
//!                                              ▼           ▼
//!                                     ┌──────────────┐ ┌──────────────┐
//!                                     │ Local        │ │ Remote       │
//!                                     │ Store        │ │ Persister    │
//!                                     └──────────────┘ └──────────────┘
//!                                                       │          │
//!                                                       ▼          ▼
//!                                                  S3 Bucket   PostgreSQL
//! ```

pub mod api;
pub mod blob;
pub mod config;
pub mod error;
pub mod ingest;
pub mod key_lock;
pub mod local_store;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory_store;
pub mod metadata;
pub mod naming;
pub mod record_store;
pub mod remote;
pub mod s3_store;
pub mod store;

pub use api::{create_router, start_api_server, AppState, IngestResponse};
pub use blob::{BlobSpooler, SpooledBlob};
pub use config::Config;
pub use error::{IngestError, IngestResult};
pub use ingest::{IngestOutcome, IngestRequest, Ingestor};
pub use local_store::LocalStore;
pub use metadata::{validate_metadata, MetadataRecord, ValidatedBatch};
pub use naming::{resolve, StorageKey};
pub use record_store::PgRecordStore;
pub use remote::RemotePersister;
pub use s3_store::S3BlobStore;
pub use store::{BlobStore, RecordStore};
