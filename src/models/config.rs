//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::retry::RetryPolicy;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Traversal and page fetching behavior
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Page worker pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Object storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Document indexing loop settings
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Vector store endpoint
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Override values from the environment, if present.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CRAWL_ROOT_URL") {
            self.crawler.root_url = url;
        }
        if let Some(secs) = env_parse("CRAWL_TIMEOUT_SECS") {
            self.crawler.timeout_secs = secs;
        }
        if let Some(n) = env_parse("MAX_CONCURRENT") {
            self.crawler.max_concurrent = n;
        }
        if let Some(n) = env_parse("POOL_SIZE") {
            self.pool.size = n;
        }
        if let Ok(bucket) = std::env::var("S3_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Ok(prefix) = std::env::var("S3_PREFIX") {
            self.storage.folder = prefix.trim_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("LEDGER_PATH") {
            self.indexer.ledger_path = path;
        }
        if let Ok(host) = std::env::var("PINECONE_HOST") {
            self.vector_store.host = host;
        }
        if let Ok(key) = std::env::var("PINECONE_API_KEY") {
            self.vector_store.api_key = Some(key);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if url::Url::parse(&self.crawler.root_url).is_err() {
            return Err(AppError::validation("crawler.root_url is not a valid URL"));
        }
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.crawler.fetch_attempts == 0 || self.crawler.download_attempts == 0 {
            return Err(AppError::validation("retry attempts must be > 0"));
        }
        if self.pool.size == 0 {
            return Err(AppError::validation("pool.size must be > 0"));
        }
        let needed = self.min_acquire_timeout_secs();
        if self.pool.acquire_timeout_secs < needed {
            return Err(AppError::validation(format!(
                "pool.acquire_timeout_secs must be at least {needed} for {} concurrent fetches \
                 over {} workers",
                self.crawler.max_concurrent, self.pool.size
            )));
        }
        if self.storage.folder.trim_matches('/').is_empty() {
            return Err(AppError::validation("storage.folder is empty"));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.trim().is_empty() {
            return Err(AppError::validation("storage.bucket is empty"));
        }
        if self.indexer.chunk_size == 0 {
            return Err(AppError::validation("indexer.chunk_size must be > 0"));
        }
        if self.indexer.chunk_overlap >= self.indexer.chunk_size {
            return Err(AppError::validation(
                "indexer.chunk_overlap must be smaller than indexer.chunk_size",
            ));
        }
        if self.indexer.batch_size == 0 || self.indexer.upsert_batch_size == 0 {
            return Err(AppError::validation("indexer batch sizes must be > 0"));
        }
        Ok(())
    }

    /// Longest a detail fetch can queue for a worker: every fetch ahead of
    /// it holds its worker for up to `timeout × attempts`.
    pub fn min_acquire_timeout_secs(&self) -> u64 {
        let size = self.pool.size.max(1);
        let rounds = self.crawler.max_concurrent.div_ceil(size).saturating_sub(1) as u64;
        rounds * self.crawler.timeout_secs * u64::from(self.crawler.fetch_attempts)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Traversal and HTTP behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Top of the year/month listing hierarchy
    #[serde(default = "defaults::root_url")]
    pub root_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Page load timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// CSS selector whose presence means the page finished rendering
    #[serde(default = "defaults::content_marker")]
    pub content_marker: String,

    /// Delay after each page fetch in milliseconds
    #[serde(default = "defaults::request_delay")]
    pub request_delay_ms: u64,

    /// Concurrent detail-page resolutions per listing page
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Page fetch attempts
    #[serde(default = "defaults::fetch_attempts")]
    pub fetch_attempts: u32,

    /// Backoff between page fetch attempts in milliseconds
    #[serde(default = "defaults::fetch_backoff")]
    pub fetch_backoff_ms: u64,

    /// Asset download timeout in seconds
    #[serde(default = "defaults::download_timeout")]
    pub download_timeout_secs: u64,

    /// Asset download attempts
    #[serde(default = "defaults::download_attempts")]
    pub download_attempts: u32,

    /// File receiving one stored reference per line
    #[serde(default = "defaults::output_file")]
    pub output_file: String,
}

impl CrawlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fixed backoff between page attempts.
    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.fetch_attempts,
            Duration::from_millis(self.fetch_backoff_ms),
        )
    }

    /// Exponential backoff for plain byte downloads (1s, 2s, 4s, ...).
    pub fn download_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.download_attempts, Duration::from_secs(1))
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            root_url: defaults::root_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            content_marker: defaults::content_marker(),
            request_delay_ms: defaults::request_delay(),
            max_concurrent: defaults::max_concurrent(),
            fetch_attempts: defaults::fetch_attempts(),
            fetch_backoff_ms: defaults::fetch_backoff(),
            download_timeout_secs: defaults::download_timeout(),
            download_attempts: defaults::download_attempts(),
            output_file: defaults::output_file(),
        }
    }
}

/// Which kind of page worker the pool creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerBackend {
    /// Plain HTTP session
    #[default]
    Http,
    /// Headless Chrome (requires the `browser` feature)
    Browser,
}

/// Page worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub backend: WorkerBackend,

    /// Maximum number of live workers
    #[serde(default = "defaults::pool_size")]
    pub size: usize,

    /// Longest wait for a free worker in seconds
    #[serde(default = "defaults::acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Worker creation attempts
    #[serde(default = "defaults::create_attempts")]
    pub create_attempts: u32,

    /// Pause between worker creation attempts in milliseconds
    #[serde(default = "defaults::create_backoff")]
    pub create_backoff_ms: u64,

    /// Prefix of every worker's scratch directory
    #[serde(default = "defaults::scratch_prefix")]
    pub scratch_prefix: String,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn create_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.create_attempts,
            Duration::from_millis(self.create_backoff_ms),
        )
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackend::default(),
            size: defaults::pool_size(),
            acquire_timeout_secs: defaults::acquire_timeout(),
            create_attempts: defaults::create_attempts(),
            create_backoff_ms: defaults::create_backoff(),
            scratch_prefix: defaults::scratch_prefix(),
        }
    }
}

/// Where stored documents live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// S3 bucket name
    #[serde(default = "defaults::bucket")]
    pub bucket: String,

    /// Top-level key folder for documents
    #[serde(default = "defaults::folder")]
    pub folder: String,

    /// Root directory for the local backend
    #[serde(default = "defaults::local_root")]
    pub local_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: defaults::bucket(),
            folder: defaults::folder(),
            local_root: defaults::local_root(),
        }
    }
}

/// Indexing loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// SQLite file recording processed keys
    #[serde(default = "defaults::ledger_path")]
    pub ledger_path: String,

    /// Storage prefix to scan
    #[serde(default = "defaults::folder")]
    pub prefix: String,

    /// Key suffixes eligible for indexing
    #[serde(default = "defaults::extensions")]
    pub extensions: Vec<String>,

    /// New documents processed per cycle
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Retry budget for failed documents
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Failed documents re-attempted per cycle
    #[serde(default = "defaults::retry_per_cycle")]
    pub retry_per_cycle: usize,

    /// Sleep between cycles in seconds
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_secs: u64,

    /// Pause between documents in milliseconds
    #[serde(default = "defaults::item_pause")]
    pub item_pause_ms: u64,

    /// Smallest document worth extracting, in bytes
    #[serde(default = "defaults::min_file_bytes")]
    pub min_file_bytes: u64,

    /// Smallest extracted text worth indexing, in characters
    #[serde(default = "defaults::min_text_chars")]
    pub min_text_chars: usize,

    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "defaults::chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunks per vector store request
    #[serde(default = "defaults::upsert_batch_size")]
    pub upsert_batch_size: usize,

    /// Pause between upsert requests in milliseconds
    #[serde(default = "defaults::upsert_pause")]
    pub upsert_pause_ms: u64,

    /// Characters kept in each chunk's preview
    #[serde(default = "defaults::preview_chars")]
    pub preview_chars: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            ledger_path: defaults::ledger_path(),
            prefix: defaults::folder(),
            extensions: defaults::extensions(),
            batch_size: defaults::batch_size(),
            max_retries: defaults::max_retries(),
            retry_per_cycle: defaults::retry_per_cycle(),
            poll_interval_secs: defaults::poll_interval(),
            item_pause_ms: defaults::item_pause(),
            min_file_bytes: defaults::min_file_bytes(),
            min_text_chars: defaults::min_text_chars(),
            chunk_size: defaults::chunk_size(),
            chunk_overlap: defaults::chunk_overlap(),
            upsert_batch_size: defaults::upsert_batch_size(),
            upsert_pause_ms: defaults::upsert_pause(),
            preview_chars: defaults::preview_chars(),
        }
    }
}

/// Vector store endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Index host, e.g. `https://denning-abc123.svc.pinecone.io`
    #[serde(default)]
    pub host: String,

    #[serde(default = "defaults::namespace")]
    pub namespace: String,

    /// Usually supplied through `PINECONE_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    /// Record field embedded by the index
    #[serde(default = "defaults::text_field")]
    pub text_field: String,

    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            namespace: defaults::namespace(),
            api_key: None,
            text_field: defaults::text_field(),
            timeout_secs: defaults::timeout(),
        }
    }
}

mod defaults {
    // Crawler defaults
    pub fn root_url() -> String {
        "https://new.kenyalaw.org/judgments/court-class/superior-courts/".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn content_marker() -> String {
        "body".into()
    }
    pub fn request_delay() -> u64 {
        500
    }
    pub fn max_concurrent() -> usize {
        3
    }
    pub fn fetch_attempts() -> u32 {
        2
    }
    pub fn fetch_backoff() -> u64 {
        2000
    }
    pub fn download_timeout() -> u64 {
        30
    }
    pub fn download_attempts() -> u32 {
        4
    }
    pub fn output_file() -> String {
        "stored_links.txt".into()
    }

    // Pool defaults
    pub fn pool_size() -> usize {
        1
    }
    pub fn acquire_timeout() -> u64 {
        180
    }
    pub fn create_attempts() -> u32 {
        3
    }
    pub fn create_backoff() -> u64 {
        2000
    }
    pub fn scratch_prefix() -> String {
        "harvester_worker_".into()
    }

    // Storage defaults
    pub fn bucket() -> String {
        "denningdata".into()
    }
    pub fn folder() -> String {
        "documents".into()
    }
    pub fn local_root() -> String {
        "storage".into()
    }

    // Indexer defaults
    pub fn ledger_path() -> String {
        "data/processed_docs.db".into()
    }
    pub fn extensions() -> Vec<String> {
        vec![".pdf".into()]
    }
    pub fn batch_size() -> usize {
        20
    }
    pub fn max_retries() -> u32 {
        1
    }
    pub fn retry_per_cycle() -> usize {
        5
    }
    pub fn poll_interval() -> u64 {
        30
    }
    pub fn item_pause() -> u64 {
        200
    }
    pub fn min_file_bytes() -> u64 {
        50
    }
    pub fn min_text_chars() -> usize {
        10
    }
    pub fn chunk_size() -> usize {
        768
    }
    pub fn chunk_overlap() -> usize {
        128
    }
    pub fn upsert_batch_size() -> usize {
        25
    }
    pub fn upsert_pause() -> u64 {
        500
    }
    pub fn preview_chars() -> usize {
        200
    }

    // Vector store defaults
    pub fn namespace() -> String {
        "judgments".into()
    }
    pub fn text_field() -> String {
        "chunk_text".into()
    }
}
