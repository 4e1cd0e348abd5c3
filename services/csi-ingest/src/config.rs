use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest chunk the local persister may write with
pub const MIN_LOCAL_CHUNK_BYTES: usize = 64 * 1024;

/// Smallest part size S3 accepts for a non-final multipart part
pub const MIN_MULTIPART_PART_BYTES: usize = 5 * 1024 * 1024;

/// Main configuration for the ingest service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Request handling limits
    #[serde(default)]
    pub ingest: IngestLimits,
    /// Local filesystem storage
    #[serde(default)]
    pub local: LocalConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Per-request limits and remote call timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct IngestLimits {
    /// Largest accepted CSI blob in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Persistence operations allowed in flight at once
    #[serde(default = "default_max_concurrent_ingests")]
    pub max_concurrent_ingests: usize,
    /// Timeout for a single blob upload in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
    /// Timeout for a metadata batch write in seconds
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

/// Local filesystem storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory the partition hierarchy is created under
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
    /// Directory incoming blobs are spooled to while a request is processed
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// Write chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for CSI blobs
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Root segment of every partition path
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "csi-ingest".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_max_concurrent_ingests() -> usize {
    16
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_metadata_timeout_secs() -> u64 {
    30
}

fn default_local_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("csi-ingest-spool")
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_bucket() -> String {
    "wiros-csi-data".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_key_prefix() -> String {
    "csi-data".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/ingest").required(false))
            .add_source(config::File::with_name("/etc/csi-ingest/ingest").required(false))
            // Override with environment variables
            // INGEST__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "database.url".to_string(),
            ));
        }

        if self.s3.key_prefix.is_empty() || self.s3.key_prefix.contains('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.key_prefix".to_string(),
                message: "Prefix must be a single non-empty path segment".to_string(),
            });
        }

        if self.ingest.max_file_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_file_size_bytes".to_string(),
                message: "Maximum file size must be greater than 0".to_string(),
            });
        }

        if self.ingest.max_concurrent_ingests == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_concurrent_ingests".to_string(),
                message: "Concurrency limit must be greater than 0".to_string(),
            });
        }

        if self.ingest.upload_timeout_secs == 0 || self.ingest.metadata_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.upload_timeout_secs/metadata_timeout_secs".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        if self.local.chunk_size_bytes < MIN_LOCAL_CHUNK_BYTES {
            return Err(ConfigValidationError::InvalidValue {
                field: "local.chunk_size_bytes".to_string(),
                message: format!("Chunk size must be at least {} bytes", MIN_LOCAL_CHUNK_BYTES),
            });
        }

        if self.s3.part_size_bytes < MIN_MULTIPART_PART_BYTES {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: format!("Part size must be at least {} bytes", MIN_MULTIPART_PART_BYTES),
            });
        }

        Ok(())
    }
}

impl IngestLimits {
    /// Get upload timeout as Duration
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Get metadata write timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            max_concurrent_ingests: default_max_concurrent_ingests(),
            upload_timeout_secs: default_upload_timeout_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
            spool_dir: default_spool_dir(),
            chunk_size_bytes: default_chunk_size(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            key_prefix: default_key_prefix(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}
