//! Object store contract and the S3-compatible implementation.
//!
//! A flat bucket keyed by `group_<id>/<hash>_<safe-filename>`; bytes
//! are opaque to the core.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::config::ObjectStoreSettings;
use crate::error::{Error, Result};
use crate::models::sanitize_filename;

/// Object key for an uploaded document.
pub fn object_key(group_id: i64, content_hash: &str, filename: &str) -> String {
    format!(
        "group_{}/{}_{}",
        group_id,
        content_hash,
        sanitize_filename(filename)
    )
}

/// Flat-bucket object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Download an object to a local file.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Size of an object, or `None` when absent.
    async fn stat(&self, key: &str) -> Result<Option<u64>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Presigned GET URL with a bounded TTL.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// S3-compatible implementation (MinIO in the default stack).
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(settings: &ObjectStoreSettings) -> Self {
        let credentials = aws_sdk_s3::config::Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "docrig",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .endpoint_url(&settings.endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: settings.bucket.clone(),
        }
    }

    /// Create the bucket if absent. Idempotent.
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::TransientExternal(format!("create bucket: {e}")))?;
        info!(bucket = %self.bucket, "created object store bucket");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Error::TransientExternal(format!("object put: {e}")))?;
        debug!(key, "stored object");
        Ok(())
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<()> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::DataConsistency(format!("object {key} missing: {e}")))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::TransientExternal(format!("object read: {e}")))?
            .into_bytes();
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(head.content_length().map(|len| len as u64)),
            Err(_) => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::TransientExternal(format!("object delete: {e}")))?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| Error::InputInvalid(format!("presign ttl: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| Error::TransientExternal(format!("presign: {e}")))?;
        Ok(presigned.uri().to_string())
    }
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::DataConsistency(format!("object {key} missing")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<u64>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|b| b.len() as u64))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }
}
