use crate::blob::SpooledBlob;
use crate::config::S3Config;
use crate::naming::StorageKey;
use crate::store::BlobStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

const CONTENT_TYPE: &str = "application/octet-stream";

/// S3-backed blob store for CSI captures
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    multipart_threshold: u64,
    part_size: usize,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            multipart_threshold: config.multipart_threshold_bytes as u64,
            part_size: config.part_size_bytes,
        })
    }

    /// Check the bucket at startup. A missing bucket is only a warning so the
    /// service can come up before the bucket is provisioned.
    pub async fn check_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Connected to S3 bucket");
                Ok(())
            }
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    warn!(
                        bucket = %self.bucket,
                        "S3 bucket does not exist, it may need to be created"
                    );
                    Ok(())
                } else {
                    Err(e).context("Failed to access S3 bucket")
                }
            }
        }
    }

    /// Single-part upload streamed from the spool file
    async fn simple_upload(
        &self,
        key: &StorageKey,
        object_key: &str,
        blob: &SpooledBlob,
    ) -> Result<()> {
        let body = ByteStream::from_path(blob.path())
            .await
            .context("Failed to open spooled blob")?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .content_type(CONTENT_TYPE)
            .metadata("file-name", &key.file_name)
            .send()
            .await
            .context("Failed to upload blob to S3")?;

        Ok(())
    }

    /// Multipart upload for large blobs, aborted if any part fails
    async fn multipart_upload(
        &self,
        key: &StorageKey,
        object_key: &str,
        blob: &SpooledBlob,
    ) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type(CONTENT_TYPE)
            .metadata("file-name", &key.file_name)
            .send()
            .await
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(object_key, &upload_id, blob).await {
            Ok(completed_parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(object_key, error = %abort, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        object_key: &str,
        upload_id: &str,
        blob: &SpooledBlob,
    ) -> Result<Vec<CompletedPart>> {
        let mut reader = blob.open().await.context("Failed to open spooled blob")?;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let mut part = Vec::with_capacity(self.part_size);
            (&mut reader)
                .take(self.part_size as u64)
                .read_to_end(&mut part)
                .await
                .context("Failed to read spooled blob")?;

            if part.is_empty() {
                break;
            }

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .context("Failed to upload part")?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, blob), fields(key = %key, size_bytes = blob.len()))]
    async fn put(&self, key: &StorageKey, blob: &SpooledBlob) -> Result<()> {
        let object_key = key.object_key();

        debug!(object_key = %object_key, "Uploading blob to S3");

        if blob.len() > self.multipart_threshold {
            self.multipart_upload(key, &object_key, blob).await?;
        } else {
            self.simple_upload(key, &object_key, blob).await?;
        }

        info!(
            object_key = %object_key,
            size_bytes = blob.len(),
            "Blob uploaded successfully"
        );

        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.object_key())
            .send()
            .await
            .context("Failed to delete blob from S3")?;

        debug!("Blob deleted from S3");
        Ok(())
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.object_key())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e).context("Failed to check blob existence")
                }
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .context("S3 bucket is not reachable")?;
        Ok(())
    }
}
