//! Content-addressed blob storage (§4.4 of `SPEC_FULL.md`... see §4 Blob
//! Store).
//!
//! [`LocalBlobStore`] (filesystem, default) and [`S3BlobStore`] (behind the
//! `s3-blob-store` feature) both implement [`BlobStore`]; callers never
//! branch on which backend is active, mirroring the teacher's
//! `vector-lancedb`/`vector-qdrant` backend-swap pattern applied to blobs
//! instead of vectors.

use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::types::BlobError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bucket: &str, content: Vec<u8>) -> Result<(), BlobError>;
    async fn get(&self, key: &str, bucket: &str) -> Result<Vec<u8>, BlobError>;
    async fn delete(&self, key: &str, bucket: &str) -> Result<(), BlobError>;
    async fn exists(&self, key: &str, bucket: &str) -> Result<bool, BlobError>;
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9!_.*'()/-]+$").expect("static blob key pattern is valid")
    })
}

/// Keys must look like `stories/{participantId}/{pluginType}/v{n}_{epoch}.json`
/// or similar — no path traversal, no characters outside a conservative
/// allow-list (§6).
fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.contains("..")
        && !key.starts_with('/')
        && key_pattern().is_match(key);
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

/// Filesystem-backed default. Buckets map to subdirectories under a root.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bucket: &str, content: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        let path = self.path_for(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Backend(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str, bucket: &str) -> Result<Vec<u8>, BlobError> {
        validate_key(key)?;
        let path = self.path_for(bucket, key);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Backend(e.to_string())
            }
        })
    }

    async fn delete(&self, key: &str, bucket: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        let path = self.path_for(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Backend(e.to_string())),
        }
    }

    async fn exists(&self, key: &str, bucket: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        Ok(tokio::fs::try_exists(self.path_for(bucket, key))
            .await
            .unwrap_or(false))
    }
}

#[cfg(feature = "s3-blob-store")]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

#[cfg(feature = "s3-blob-store")]
impl S3BlobStore {
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
        }
    }
}

#[cfg(feature = "s3-blob-store")]
#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bucket: &str, content: Vec<u8>) -> Result<(), BlobError> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(content.into())
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str, bucket: &str) -> Result<Vec<u8>, BlobError> {
        validate_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str, bucket: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str, bucket: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let svc_err = e.into_service_error();
                if svc_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(BlobError::Backend(svc_err.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        assert!(validate_key("stories/p1/twine/v1_123.json").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("stories/p1/twine/../../v1.json").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("stories/p1/twi ne/v1.json").is_err());
    }

    #[tokio::test]
    async fn round_trips_through_local_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let key = "stories/p1/twine/v1_1.json";
        store.put(key, "default", b"hello".to_vec()).await.unwrap();
        assert!(store.exists(key, "default").await.unwrap());
        let content = store.get(key, "default").await.unwrap();
        assert_eq!(content, b"hello");
        store.delete(key, "default").await.unwrap();
        assert!(!store.exists(key, "default").await.unwrap());
    }
}
