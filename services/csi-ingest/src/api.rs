use crate::blob::{BlobSpooler, SpooledBlob};
use crate::config::ApiConfig;
use crate::error::{IngestError, IngestResult};
use crate::ingest::{IngestRequest, Ingestor};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Form field carrying the JSON metadata array
pub const FIELD_METADATA: &str = "metadata";
/// Form field requesting a local copy
pub const FIELD_SAVE_LOCAL: &str = "save_to_server";
/// Form field requesting remote persistence
pub const FIELD_SAVE_REMOTE: &str = "save_to_s3_storage";
/// Form field carrying the CSI blob
pub const FIELD_BLOB: &str = "csi_blob";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    /// Where incoming blobs are spooled
    pub spool_dir: PathBuf,
    /// Largest accepted blob in bytes
    pub max_file_size: u64,
}

impl AppState {
    /// Whole request limit, leaving room for the metadata part next to a
    /// maximum-size blob
    pub fn body_limit(&self) -> u64 {
        self.max_file_size.saturating_mul(2)
    }
}

/// Successful ingest response
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub filename: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = usize::try_from(state.body_limit()).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ingest", post(ingest_csi_data))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness only; remote stores are probed by `/ready`
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let remote = state.ingestor.remote();
    let (blob_store, record_store) =
        tokio::join!(remote.blob_store().ping(), remote.record_store().ping());

    let describe = |result: &anyhow::Result<()>| match result {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("disconnected: {:#}", e),
    };

    let status = if blob_store.is_ok() && record_store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "blob_store": describe(&blob_store),
            "record_store": describe(&record_store),
        })),
    )
}

/// Accept one CSI blob with its metadata
#[instrument(skip(state, multipart))]
async fn ingest_csi_data(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<IngestResponse>, IngestError> {
    let request = read_form(&state, multipart).await?;
    let outcome = state.ingestor.ingest(request).await?;

    Ok(Json(IngestResponse {
        message: "File ingested successfully".to_string(),
        filename: outcome.key.file_name,
    }))
}

/// Collect the form fields, spooling the blob as it streams in
async fn read_form(state: &AppState, mut multipart: Multipart) -> IngestResult<IngestRequest> {
    let mut metadata = None;
    let mut save_local = None;
    let mut save_remote = None;
    let mut blob: Option<SpooledBlob> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, None, state))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            FIELD_METADATA => metadata = Some(read_text(field, FIELD_METADATA, state).await?),
            FIELD_SAVE_LOCAL => {
                save_local = Some(read_text(field, FIELD_SAVE_LOCAL, state).await?)
            }
            FIELD_SAVE_REMOTE => {
                save_remote = Some(read_text(field, FIELD_SAVE_REMOTE, state).await?)
            }
            FIELD_BLOB => {
                let mut spooler = BlobSpooler::create(&state.spool_dir, state.max_file_size).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| multipart_error(e, Some(FIELD_BLOB), state))?
                {
                    spooler.write_chunk(&chunk).await?;
                }
                blob = Some(spooler.finish().await?);
            }
            other => debug!(field = %other, "Ignoring unknown form field"),
        }
    }

    let metadata = metadata.ok_or_else(|| IngestError::MissingField(FIELD_METADATA.to_string()))?;
    let save_local = parse_flag(FIELD_SAVE_LOCAL, save_local)?;
    let save_remote = parse_flag(FIELD_SAVE_REMOTE, save_remote)?;
    let blob = blob.ok_or_else(|| IngestError::MissingField(FIELD_BLOB.to_string()))?;

    info!(
        save_local,
        save_remote,
        size_bytes = blob.len(),
        "Received ingest request"
    );

    Ok(IngestRequest {
        metadata,
        save_local,
        save_remote,
        blob,
    })
}

async fn read_text(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
    state: &AppState,
) -> IngestResult<String> {
    field
        .text()
        .await
        .map_err(|e| multipart_error(e, Some(name), state))
}

/// Map a multipart failure, naming the field that overran the size limit.
/// `field` is `None` when the failure happened between fields.
fn multipart_error(error: MultipartError, field: Option<&str>, state: &AppState) -> IngestError {
    if error.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return IngestError::Multipart(error.body_text());
    }

    match field {
        Some(FIELD_BLOB) => IngestError::BlobTooLarge {
            limit: state.max_file_size,
        },
        other => IngestError::PayloadTooLarge {
            field: other.unwrap_or("form").to_string(),
            limit: state.body_limit(),
        },
    }
}

/// Parse a persistence flag. Only unambiguous boolean spellings are accepted.
pub fn parse_flag(field: &str, value: Option<String>) -> IngestResult<bool> {
    let value = value.ok_or_else(|| IngestError::MissingField(field.to_string()))?;

    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(IngestError::InvalidFlag {
            field: field.to_string(),
            value,
        }),
    }
}

/// Start the ingest API server, stopping once `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingest API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
