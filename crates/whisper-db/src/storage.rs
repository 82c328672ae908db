//! MinIO / S3-compatible object storage presigner.
//!
//! Wraps `aws-sdk-s3` to mint short-lived presigned PUT/GET URLs for
//! encrypted attachments and to delete expired objects during GC. The server
//! never streams object bytes in either direction.

use anyhow::{Context, Result};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::{
    config::{Builder as S3Builder, Credentials, Region},
    Client,
};
use std::time::Duration;

/// Storage configuration (loaded from app config).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// MinIO / S3 endpoint URL (e.g. `http://localhost:9000`)
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Region (use `us-east-1` for MinIO)
    pub region: String,
    /// Presigned URL lifetime.
    pub presign_ttl_secs: u64,
}

/// S3/MinIO presigning client — wraps the AWS SDK.
#[derive(Clone)]
pub struct StorageClient {
    inner: Client,
    bucket: String,
    presign_ttl: Duration,
}

impl StorageClient {
    /// Initialise client from config.
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let creds = Credentials::new(
            &cfg.access_key,
            &cfg.secret_key,
            None, // session token
            None, // expiry
            "whisper-storage",
        );

        let s3_cfg = S3Builder::new()
            .endpoint_url(&cfg.endpoint)
            .credentials_provider(creds)
            .region(Region::new(cfg.region.clone()))
            // Force path-style URLs (required for MinIO)
            .force_path_style(true)
            .build();

        Ok(Self {
            inner: Client::from_conf(s3_cfg),
            bucket: cfg.bucket.clone(),
            presign_ttl: Duration::from_secs(cfg.presign_ttl_secs),
        })
    }

    /// Presigned PUT URL for a fresh upload, bound to the declared
    /// content type.
    pub async fn presigned_put_url(&self, key: &str, content_type: &str) -> Result<String> {
        let presigning_cfg = PresigningConfig::expires_in(self.presign_ttl)
            .context("Failed to build presigning config")?;

        let req = self
            .inner
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_cfg)
            .await
            .with_context(|| format!("Failed to presign upload for {key}"))?;

        Ok(req.uri().to_string())
    }

    /// Presigned GET URL for an authorized download.
    pub async fn presigned_get_url(&self, key: &str) -> Result<String> {
        let presigning_cfg = PresigningConfig::expires_in(self.presign_ttl)
            .context("Failed to build presigning config")?;

        let req = self
            .inner
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_cfg)
            .await
            .with_context(|| format!("Failed to presign download for {key}"))?;

        Ok(req.uri().to_string())
    }

    /// Delete an object by its storage key (GC).
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.inner
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete {key} from object storage"))?;

        Ok(())
    }

    /// Ensure the bucket exists; create it if absent.
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.inner.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::debug!(bucket = %self.bucket, "Bucket already exists");
                Ok(())
            }
            Err(_) => {
                tracing::info!(bucket = %self.bucket, "Bucket does not exist, creating");
                self.inner
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .context("Failed to create object storage bucket")?;
                Ok(())
            }
        }
    }
}
