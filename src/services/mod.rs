//! Service layer for the harvester.
//!
//! This module contains the business logic for:
//! - Link extraction from listing and detail pages (`links`)
//! - Pooled page workers and fetching (`PageFetcher`, `WorkerPool`)
//! - Download-once asset persistence (`AssetPersister`)
//! - Text extraction, chunking and vector upserts for the indexer

pub mod chunker;
pub mod extract;
pub mod fetcher;
pub mod links;
pub mod persister;
pub mod pool;
pub mod vector;
pub mod worker;

pub use chunker::{TextSplitter, clean_text};
pub use extract::{ExtractedText, PdfToText, TextExtractor};
pub use fetcher::{Page, PageFetcher, PageSource};
pub use links::LinkSet;
pub use persister::{AssetPersister, AssetSource, HttpDownloader, VisitedSet};
pub use pool::{PooledWorker, WorkerPool};
pub use vector::{PineconeSink, VectorSink};
#[cfg(feature = "browser")]
pub use worker::{ChromeWorker, ChromeWorkerFactory};
pub use worker::{HttpWorker, HttpWorkerFactory, PageWorker, RenderedPage, WorkerFactory};
