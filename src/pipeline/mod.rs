//! Pipeline entry points.
//!
//! - `run_crawler`: Walk the judgments listing and store every document once
//! - `run_indexer`: Index stored documents into the vector store

pub mod crawl;
pub mod index;
pub mod shutdown;

pub use crawl::{CrawlReport, CrawlWalker, run_crawler};
pub use index::{CycleReport, Indexer, Outcome, run_indexer};
pub use shutdown::spawn_signal_listener;
