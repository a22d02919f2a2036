// src/services/persister.rs

//! Download-once persistence of document assets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, REFERER};
use tokio::sync::OnceCell;

use crate::error::{AppError, Result};
use crate::models::{AssetReference, CrawlerConfig, StoredRef, content_type_for, storage_key};
use crate::storage::BlobStore;
use crate::utils::http::create_download_client;
use crate::utils::retry::RetryPolicy;

/// Fetches raw asset bytes.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`AssetSource`] over a dedicated HTTP client with retries.
pub struct HttpDownloader {
    client: reqwest::Client,
    policy: RetryPolicy,
    referer: String,
}

impl HttpDownloader {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        Ok(Self {
            client: create_download_client(config)?,
            policy: config.download_policy(),
            referer: config.root_url.clone(),
        })
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/pdf,application/octet-stream,*/*")
            .header(REFERER, &self.referer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl AssetSource for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.policy
            .run(url, move |_| self.attempt(url), AppError::is_transient)
            .await
    }
}

type Slot = Arc<OnceCell<Option<StoredRef>>>;

/// Asset URLs already dispatched for persistence in this process.
///
/// Each URL owns one slot; whoever claims it first does the work and
/// every other caller waits for and shares that result.
#[derive(Default)]
pub struct VisitedSet {
    slots: Mutex<HashMap<String, Slot>>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `url`; true if it was not present before.
    #[cfg(test)]
    pub fn check_and_insert(&self, url: &str) -> bool {
        self.claim(url).1
    }

    #[cfg(test)]
    pub fn contains(&self, url: &str) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.contains_key(url))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn claim(&self, url: &str) -> (Slot, bool) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slots.get(url) {
            Some(slot) => (Arc::clone(slot), false),
            None => {
                let slot = Slot::default();
                slots.insert(url.to_string(), Arc::clone(&slot));
                (slot, true)
            }
        }
    }
}

/// Stores each distinct asset exactly once.
pub struct AssetPersister {
    store: Arc<dyn BlobStore>,
    source: Arc<dyn AssetSource>,
    folder: String,
    visited: VisitedSet,
}

impl AssetPersister {
    pub fn new(store: Arc<dyn BlobStore>, source: Arc<dyn AssetSource>, folder: &str) -> Self {
        Self {
            store,
            source,
            folder: folder.trim_matches('/').to_string(),
            visited: VisitedSet::new(),
        }
    }

    #[cfg(test)]
    pub fn visited(&self) -> &VisitedSet {
        &self.visited
    }

    /// Persist `asset`, returning where it lives. Failures are logged and
    /// yield `None`; they are not retried within this process.
    pub async fn persist(&self, asset: &AssetReference) -> Option<StoredRef> {
        let (slot, _) = self.visited.claim(&asset.source_url);
        slot.get_or_init(|| async {
            match self.store_once(asset).await {
                Ok(stored) => Some(stored),
                Err(e) => {
                    log::warn!("Failed to persist {}: {}", asset.source_url, e);
                    None
                }
            }
        })
        .await
        .clone()
    }

    async fn store_once(&self, asset: &AssetReference) -> Result<StoredRef> {
        let key = storage_key(&self.folder, asset.period, &asset.source_url);

        if self.store.exists(&key).await? {
            log::debug!("Already stored: {}", self.store.location(&key));
            return Ok(self.store.stored_ref(&key));
        }

        let bytes = self.source.download(&asset.source_url).await?;
        if bytes.is_empty() {
            return Err(AppError::EmptyPayload(asset.source_url.clone()));
        }

        let size = bytes.len();
        self.store.put(&key, bytes, content_type_for(&key)).await?;
        let stored = self.store.stored_ref(&key);
        log::info!("Stored {} ({} bytes) at {}", asset.source_url, size, stored.location);
        Ok(stored)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::models::{ArchivePeriod, ObjectSummary};
    use crate::storage::LocalStore;

    /// Serves fixed bytes for every URL and counts downloads.
    pub struct FakeSource {
        pub body: Vec<u8>,
        pub calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AssetSource for FakeSource {
        async fn download(&self, _url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.body.clone())
        }
    }

    /// Store whose existence check always fails.
    struct BrokenStore;

    #[async_trait]
    impl BlobStore for BrokenStore {
        async fn exists(&self, _: &str) -> Result<bool> {
            Err(AppError::storage("500 internal error"))
        }
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn put(&self, _: &str, _: Vec<u8>, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<ObjectSummary>> {
            Ok(Vec::new())
        }
        fn location(&self, key: &str) -> String {
            format!("broken://{key}")
        }
        async fn verify_access(&self) -> Result<()> {
            Ok(())
        }
    }

    const ASSET: &str = "https://new.kenyalaw.org/akn/ke/judgment/kehc/2023/77/eng@2023-01-10/source";

    fn asset() -> AssetReference {
        AssetReference {
            source_url: ASSET.to_string(),
            period: ArchivePeriod::new(2023, 1),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_download() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let source = Arc::new(FakeSource::new(b"%PDF-1.4 body"));
        let persister = AssetPersister::new(store.clone(), source.clone(), "documents");

        let (first, second) = (asset(), asset());
        let (a, b) = tokio::join!(persister.persist(&first), persister.persist(&second));

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        let stored = a.unwrap();
        assert_eq!(stored.key, "documents/2023/01/kehc_2023_77.pdf");
        assert!(store.exists(&stored.key).await.unwrap());
        assert!(persister.visited().contains(ASSET));
    }

    #[tokio::test]
    async fn existing_object_is_not_downloaded() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        store
            .put("documents/2023/01/kehc_2023_77.pdf", vec![1], "application/pdf")
            .await
            .unwrap();
        let source = Arc::new(FakeSource::new(b"new"));
        let persister = AssetPersister::new(store, source.clone(), "documents");

        let stored = persister.persist(&asset()).await.unwrap();
        assert_eq!(stored.key, "documents/2023/01/kehc_2023_77.pdf");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_payload_stores_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let persister =
            AssetPersister::new(store.clone(), Arc::new(FakeSource::new(b"")), "documents");

        assert!(persister.persist(&asset()).await.is_none());
        assert!(store.list("documents").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn existence_check_errors_fail_without_fetching() {
        let source = Arc::new(FakeSource::new(b"data"));
        let persister = AssetPersister::new(Arc::new(BrokenStore), source.clone(), "documents");

        assert!(persister.persist(&asset()).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn check_and_insert_is_first_wins() {
        let visited = VisitedSet::new();
        assert!(visited.is_empty());
        assert!(visited.check_and_insert("u"));
        assert!(!visited.check_and_insert("u"));
        assert_eq!(visited.len(), 1);
    }
}
