//! Storage abstractions for harvested documents.
//!
//! Documents are blobs addressed by key:
//!
//! ```text
//! {folder}/
//! └── YYYY/
//!     └── MM/
//!         ├── kehc_2023_77.pdf
//!         └── ...
//! ```
//!
//! The processed-documents ledger lives next to the indexer in SQLite.

pub mod ledger;
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{ObjectSummary, StorageBackend, StorageConfig, StoredRef};

// Re-export for convenience
pub use ledger::Ledger;
pub use local::LocalStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// Key-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether `key` exists. "Absent" answers (404, 403 without list
    /// permission) are `Ok(false)`; anything else is an error.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read a blob, `None` if missing.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a blob under `key`, replacing any previous one.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;

    /// URI of `key` in this store.
    fn location(&self, key: &str) -> String;

    /// Fail when credentials or the bucket are unusable.
    async fn verify_access(&self) -> Result<()>;

    /// Reference to a stored key.
    fn stored_ref(&self, key: &str) -> StoredRef {
        StoredRef {
            key: key.to_string(),
            location: self.location(key),
        }
    }

    /// Copy a blob into a local file.
    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let bytes = self
            .get(key)
            .await?
            .ok_or_else(|| AppError::storage(format!("{} not found", self.location(key))))?;
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }
}

/// Build the configured store.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend {
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(&config.local_root))),
        #[cfg(feature = "s3")]
        StorageBackend::S3 => Ok(Arc::new(S3Store::from_env(&config.bucket).await?)),
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => Err(AppError::config(
            "storage.backend = \"s3\" requires the `s3` feature",
        )),
    }
}
