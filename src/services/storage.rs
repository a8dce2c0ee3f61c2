use async_trait::async_trait;
use parking_lot::Mutex;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::services::encryption::{EncryptionError, EncryptionService};

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Opaque key-value blob service holding screenshots and diff images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Content-addressed key for an image belonging to a release.
///
/// Keys are namespaced per candidate so that sweeping one release never
/// removes bytes another release still references.
pub fn image_key(candidate_id: Uuid, data: &[u8]) -> (String, String) {
    let sha256 = hex::encode(Sha256::digest(data));
    (format!("releases/{}/{}.png", candidate_id, sha256), sha256)
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait]
impl BlobStore for R2Client {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status(key, response.status_code())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.bucket.get_object(key).await {
            Ok(response) if response.status_code() == 404 => Ok(None),
            Ok(response) => {
                check_status(key, response.status_code())?;
                Ok(Some(response.to_vec()))
            }
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(StorageError::S3(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(key).await {
            Ok(response) if response.status_code() == 404 => Ok(()),
            Ok(response) => check_status(key, response.status_code()),
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(StorageError::S3(e)),
        }
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(StorageError::Status {
            key: key.to_string(),
            status,
        })
    }
}

/// In-process blob store for tests and single-node development.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().remove(key);
        Ok(())
    }
}

/// Encrypts blobs at rest with AES-256-GCM before handing them to the inner store.
pub struct SealedBlobStore {
    inner: Arc<dyn BlobStore>,
    cipher: EncryptionService,
}

impl SealedBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, cipher: EncryptionService) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl BlobStore for SealedBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let sealed = self.cipher.encrypt(data)?;
        self.inner
            .put(key, &sealed, "application/octet-stream")
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.inner.get(key).await? {
            Some(sealed) => Ok(Some(self.cipher.decrypt(&sealed)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Storage returned status {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Blob sealing failed: {0}")]
    Sealing(#[from] EncryptionError),
}
