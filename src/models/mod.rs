// src/models/mod.rs

//! Domain models for the harvester.
//!
//! Crawl hierarchy types, stored-object references, ledger entries and
//! vector-store records, plus the application configuration.

mod asset;
mod chunk;
mod config;
mod ledger;
mod target;

// Re-export all public types
pub use asset::{
    AssetReference, ObjectSummary, StoredRef, content_type_for, derive_filename, storage_key,
};
pub use chunk::{ChunkMetadata, ChunkRecord};
pub use config::{
    Config, CrawlerConfig, IndexerConfig, PoolConfig, StorageBackend, StorageConfig,
    VectorStoreConfig, WorkerBackend,
};
pub use ledger::{LedgerStatus, ProcessedEntry};
pub use target::{ArchivePeriod, CrawlLevel, CrawlTarget};

/// Summary of a finished crawl.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub years: usize,
    pub months: usize,
    pub pages: usize,
    pub details: usize,
    /// Distinct stored locations
    pub stored: usize,
    pub cancelled: bool,
}
