use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("I/O error for blob {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),
}

pub fn tape_key(job_id: Uuid) -> String {
    format!("proof-jobs/{job_id}/input.tape")
}

pub fn result_key(job_id: Uuid) -> String {
    format!("proof-jobs/{job_id}/result.json")
}

/// Opaque blob storage for tapes and result artifacts. Keys are
/// slash-separated relative paths derived from the job id; writes are
/// idempotent overwrites so retrying an artifact write is always safe.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<(), BlobStoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
}

/// Filesystem-backed blob store rooted at a data directory. The key's file
/// extension carries the content type; the `content_type` argument is
/// accepted for interface parity and ignored here.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(BlobStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), BlobStoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                BlobStoreError::Io {
                    key: key.to_string(),
                    source,
                }
            })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| BlobStoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(BlobStoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobStoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory blob store; remembers content types for assertions.
    #[derive(Default)]
    pub struct MemoryBlobStore {
        blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
    }

    impl MemoryBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn content_type(&self, key: &str) -> Option<String> {
            self.blobs
                .lock()
                .unwrap()
                .get(key)
                .map(|(_, ct)| ct.clone())
        }

        pub fn len(&self) -> usize {
            self.blobs.lock().unwrap().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put(
            &self,
            key: &str,
            bytes: &[u8],
            content_type: &str,
        ) -> Result<(), BlobStoreError> {
            self.blobs
                .lock()
                .unwrap()
                .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .get(key)
                .map(|(bytes, _)| bytes.clone()))
        }

        async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
            self.blobs.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
