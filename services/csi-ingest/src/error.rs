use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the pipeline
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that can occur while ingesting a batch
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid JSON metadata: {0}")]
    Parse(String),

    #[error("No metadata provided")]
    EmptyBatch,

    #[error("Invalid metadata packet at index {index}: field `{field}` {message}")]
    Schema {
        index: usize,
        field: String,
        message: String,
    },

    #[error("Metadata packet at index {index} has device_name `{found}`, expected `{expected}`")]
    InconsistentDevice {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("Timestamp {0} ms cannot be represented as a calendar time")]
    InvalidTimestamp(i64),

    #[error("Missing form field: {0}")]
    MissingField(String),

    #[error("Invalid value for form field {field}: {value:?}")]
    InvalidFlag { field: String, value: String },

    #[error("Malformed multipart body: {0}")]
    Multipart(String),

    #[error("CSI blob exceeds the maximum size of {limit} bytes")]
    BlobTooLarge { limit: u64 },

    #[error("Form field `{field}` exceeds the request size limit of {limit} bytes")]
    PayloadTooLarge { field: String, limit: u64 },

    #[error("Unable to buffer the uploaded blob: {0}")]
    Spool(#[source] std::io::Error),

    #[error("Unable to save file locally: {0}")]
    LocalIo(#[source] std::io::Error),

    #[error("Unable to write metadata to the record store: {0}")]
    RemoteMetadataWrite(String),

    #[error("Unable to save file to the object store: {0}")]
    RemoteBlobUpload(String),

    #[error("{operation} timed out after {elapsed:?}")]
    RemoteTimeout {
        operation: &'static str,
        elapsed: Duration,
    },
}

impl IngestError {
    /// Build a schema error for one field of one record
    pub fn schema(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self::Schema {
            index,
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status the error is reported with
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Parse(_)
            | Self::EmptyBatch
            | Self::Schema { .. }
            | Self::InconsistentDevice { .. }
            | Self::InvalidTimestamp(_)
            | Self::MissingField(_)
            | Self::InvalidFlag { .. }
            | Self::Multipart(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BlobTooLarge { .. } | Self::PayloadTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            Self::Spool(_)
            | Self::LocalIo(_)
            | Self::RemoteMetadataWrite(_)
            | Self::RemoteBlobUpload(_)
            | Self::RemoteTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client can fix the request and retry it safely
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "INVALID_JSON",
            Self::EmptyBatch => "EMPTY_BATCH",
            Self::Schema { .. } => "INVALID_METADATA",
            Self::InconsistentDevice { .. } => "INCONSISTENT_DEVICE",
            Self::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            Self::MissingField(_) => "MISSING_FIELD",
            Self::InvalidFlag { .. } => "INVALID_FLAG",
            Self::Multipart(_) => "INVALID_MULTIPART",
            Self::BlobTooLarge { .. } => "BLOB_TOO_LARGE",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Spool(_) => "SPOOL_ERROR",
            Self::LocalIo(_) => "LOCAL_SAVE_ERROR",
            Self::RemoteMetadataWrite(_) => "METADATA_WRITE_ERROR",
            Self::RemoteBlobUpload(_) => "BLOB_UPLOAD_ERROR",
            Self::RemoteTimeout { .. } => "REMOTE_TIMEOUT",
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code().to_string();

        // Server-side details stay in the logs
        let error = if self.is_client_error() {
            self.to_string()
        } else {
            match &self {
                Self::Spool(_) => "Unable to receive file".to_string(),
                Self::LocalIo(_) => "Unable to save file locally".to_string(),
                _ => "Unable to save file to remote storage".to_string(),
            }
        };

        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_unprocessable() {
        let errors = [
            IngestError::Parse("eof".to_string()),
            IngestError::EmptyBatch,
            IngestError::schema(0, "rssi", "must be an integer"),
            IngestError::MissingField("metadata".to_string()),
        ];

        for error in errors {
            assert_eq!(error.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
            assert!(error.is_client_error());
        }
    }

    #[test]
    fn test_persistence_errors_are_server_errors() {
        let io = IngestError::LocalIo(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(io.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!io.is_client_error());

        let timeout = IngestError::RemoteTimeout {
            operation: "blob upload",
            elapsed: Duration::from_secs(300),
        };
        assert_eq!(timeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_schema_error_names_field_and_record() {
        let message = IngestError::schema(3, "timestamp", "is missing").to_string();
        assert!(message.contains("index 3"));
        assert!(message.contains("`timestamp`"));
    }

    #[test]
    fn test_oversized_blob_status() {
        let error = IngestError::BlobTooLarge { limit: 10 };
        assert_eq!(error.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error.code(), "BLOB_TOO_LARGE");
    }

    #[test]
    fn test_oversized_field_names_the_field() {
        let error = IngestError::PayloadTooLarge {
            field: "metadata".to_string(),
            limit: 128,
        };
        assert_eq!(error.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error.code(), "PAYLOAD_TOO_LARGE");
        assert!(error.to_string().contains("`metadata`"));
    }
}
