//! Blob storage for job artifacts and status objects.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to upload {key}: {reason}")]
    Upload { key: String, reason: String },
}

/// Object storage the worker writes results to.
///
/// Keys are fully formed by the caller; the store only adds its own
/// location when building the returned URL.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `key` and return the object's URL.
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

/// [`BlobStore`] backed by an S3 bucket.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                reason: DisplayErrorContext(e).to_string(),
            })?;

        tracing::debug!(bucket = %self.bucket, key, size, "Object uploaded");
        Ok(self.url_for(key))
    }
}
