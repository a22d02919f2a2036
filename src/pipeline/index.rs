// src/pipeline/index.rs

//! Indexing loop: stored documents → text → chunks → vector store.
//!
//! Every document ends up in the ledger exactly once per attempt, whatever
//! happens to it. Only `failed` entries are ever looked at again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{ChunkRecord, Config, IndexerConfig, LedgerStatus};
use crate::services::{PdfToText, PineconeSink, TextExtractor, TextSplitter, VectorSink, clean_text};
use crate::storage::{BlobStore, Ledger, open_store};
use crate::utils::sleep_or_cancel;

/// Ledger outcome of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: LedgerStatus,
    /// Short label stored as the entry's file type
    pub label: &'static str,
    pub error: Option<String>,
}

impl Outcome {
    fn indexed() -> Self {
        Self {
            status: LedgerStatus::Success,
            label: "PDF",
            error: None,
        }
    }

    fn skipped(label: &'static str, error: impl Into<String>) -> Self {
        Self {
            status: LedgerStatus::Skipped,
            label,
            error: Some(error.into()),
        }
    }

    fn failed(label: &'static str, error: impl Into<String>) -> Self {
        Self {
            status: LedgerStatus::Failed,
            label,
            error: Some(error.into()),
        }
    }
}

/// Counts for one polling cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub retried: usize,
    /// New documents found but left for later cycles
    pub pending: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CycleReport {
    fn count(&mut self, outcome: &Outcome) {
        match outcome.status {
            LedgerStatus::Success => self.indexed += 1,
            LedgerStatus::Skipped => self.skipped += 1,
            LedgerStatus::Failed => self.failed += 1,
        }
    }
}

pub struct Indexer {
    store: Arc<dyn BlobStore>,
    ledger: Arc<Ledger>,
    extractor: Arc<dyn TextExtractor>,
    sink: Arc<dyn VectorSink>,
    splitter: TextSplitter,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        ledger: Arc<Ledger>,
        extractor: Arc<dyn TextExtractor>,
        sink: Arc<dyn VectorSink>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            splitter: TextSplitter::new(config.chunk_size, config.chunk_overlap),
            store,
            ledger,
            extractor,
            sink,
            config,
        }
    }

    /// Poll until cancelled. Cycle errors are logged and the loop goes on.
    pub async fn run(&self, cancel: &CancellationToken) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        log::info!(
            "Indexer started: prefix '{}', polling every {}s",
            self.config.prefix,
            interval.as_secs()
        );

        while !cancel.is_cancelled() {
            match self.run_cycle(cancel).await {
                Ok(report) => log_cycle(&report),
                Err(e) => log::error!("Indexer cycle failed: {}", e),
            }

            log::debug!("Sleeping {}s before next poll", interval.as_secs());
            if !sleep_or_cancel(interval, cancel).await {
                break;
            }
        }

        log::info!("Indexer stopped");
        self.log_ledger();
    }

    /// One pass: retry a few failures, then index a batch of new documents.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let pause = Duration::from_millis(self.config.item_pause_ms);

        let retries = self
            .ledger
            .failed_keys(self.config.max_retries, self.config.retry_per_cycle)?;
        if !retries.is_empty() {
            log::info!("Retrying {} previously failed documents", retries.len());
        }
        for key in retries {
            if cancel.is_cancelled() {
                return Ok(report);
            }
            self.ledger.increment_retry(&key)?;
            let outcome = self.index(&key).await?;
            report.retried += 1;
            report.count(&outcome);
        }

        let pending = self.pending_keys().await?;
        if pending.is_empty() {
            log::info!("No new documents");
            return Ok(report);
        }
        log::info!("Found {} new documents", pending.len());

        let batch = pending.len().min(self.config.batch_size);
        report.pending = pending.len() - batch;
        for (i, key) in pending.iter().take(batch).enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 && !sleep_or_cancel(pause, cancel).await {
                break;
            }
            let outcome = self.index(key).await?;
            report.count(&outcome);
        }

        Ok(report)
    }

    /// Indexable keys under the prefix with no ledger entry, oldest first.
    async fn pending_keys(&self) -> Result<Vec<String>> {
        let mut objects = self.store.list(&self.config.prefix).await?;
        objects.sort_by_key(|o| o.last_modified);

        let known = self.ledger.known_keys()?;
        Ok(objects
            .into_iter()
            .map(|o| o.key)
            .filter(|key| self.is_indexable(key) && !known.contains(key))
            .collect())
    }

    fn is_indexable(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.config
            .extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }

    async fn index(&self, key: &str) -> Result<Outcome> {
        log::info!("Processing {}", key);
        let outcome = self.process_and_upsert(key).await;
        match &outcome.error {
            None => log::info!("Indexed {}", key),
            Some(error) => log::warn!("{} {}: {} ({})", outcome.status, key, outcome.label, error),
        }
        self.ledger
            .record(key, outcome.status, outcome.label, outcome.error.as_deref())?;
        Ok(outcome)
    }

    /// Download, extract, chunk and upsert one document. Never fails; the
    /// outcome says what happened.
    pub async fn process_and_upsert(&self, key: &str) -> Outcome {
        let suffix = Path::new(key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        // Removed when dropped, on every path out of this function.
        let scratch = match tempfile::Builder::new()
            .prefix("harvester_index_")
            .suffix(&suffix)
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => return Outcome::failed("Download Error", format!("scratch file: {e}")),
        };

        let size = match self.store.download_to(key, scratch.path()).await {
            Ok(size) => size,
            Err(e) => return Outcome::failed("Download Error", e.to_string()),
        };
        if size < self.config.min_file_bytes {
            return Outcome::skipped("Small File", format!("file too small ({size} bytes)"));
        }

        let extracted = match self.extractor.extract(scratch.path()).await {
            Ok(extracted) => extracted,
            Err(e) => return Outcome::skipped("PDF Error", e.to_string()),
        };
        let raw = extracted.text.trim();
        if raw.is_empty() {
            return Outcome::skipped("Empty PDF", "no content extracted");
        }
        if raw.chars().count() < self.config.min_text_chars {
            return Outcome::skipped("Low Content", "minimal content");
        }

        let chunks = self.splitter.split(&clean_text(raw));
        if chunks.is_empty() {
            return Outcome::skipped("Chunking Failed", "no chunks created");
        }

        let title = extracted
            .title
            .unwrap_or_else(|| file_stem(key).to_string());
        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| ChunkRecord::new(key, &title, i, text, self.config.preview_chars))
            .collect();

        let upserted = self.upsert_batches(key, &records).await;
        if upserted > 0 {
            log::debug!("{}: {} chunks in {} batches", key, records.len(), upserted);
            Outcome::indexed()
        } else {
            Outcome::skipped("Upsert Failed", "all upsert batches failed")
        }
    }

    /// Upsert in sub-batches, returning how many went through.
    async fn upsert_batches(&self, key: &str, records: &[ChunkRecord]) -> usize {
        let pause = Duration::from_millis(self.config.upsert_pause_ms);
        let mut succeeded = 0;

        for (i, batch) in records
            .chunks(self.config.upsert_batch_size.max(1))
            .enumerate()
        {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            match self.sink.upsert(batch).await {
                Ok(()) => succeeded += 1,
                Err(e) => log::warn!("Batch {} failed for {}: {}", i + 1, key, e),
            }
        }
        succeeded
    }

    fn log_ledger(&self) {
        match self.ledger.status_counts() {
            Ok(counts) => {
                for (status, count) in counts {
                    log::info!("  {}: {}", status, count);
                }
            }
            Err(e) => log::warn!("Could not read ledger totals: {}", e),
        }
    }
}

fn file_stem(key: &str) -> &str {
    Path::new(key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(key)
}

fn log_cycle(report: &CycleReport) {
    log::info!(
        "Cycle done: {} indexed, {} skipped, {} failed ({} retries), {} left for later",
        report.indexed,
        report.skipped,
        report.failed,
        report.retried,
        report.pending
    );
}

/// Open the store, ledger and vector sink, then index until cancelled, or
/// for a single cycle with `once`.
pub async fn run_indexer(config: &Config, once: bool, cancel: CancellationToken) -> Result<()> {
    let store = open_store(&config.storage).await?;
    store.verify_access().await?;

    let ledger = Arc::new(Ledger::open(&config.indexer.ledger_path)?);
    let sink = Arc::new(PineconeSink::new(&config.vector_store)?);
    let indexer = Indexer::new(
        store,
        ledger,
        Arc::new(PdfToText),
        sink,
        config.indexer.clone(),
    );

    if once {
        let report = indexer.run_cycle(&cancel).await?;
        log_cycle(&report);
        indexer.log_ledger();
    } else {
        indexer.run(&cancel).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::error::AppError;
    use crate::services::ExtractedText;
    use crate::storage::LocalStore;

    /// Treats the file's bytes as its text.
    struct PlainText;

    #[async_trait]
    impl TextExtractor for PlainText {
        async fn extract(&self, path: &Path) -> Result<ExtractedText> {
            let bytes = tokio::fs::read(path).await?;
            Ok(ExtractedText {
                text: String::from_utf8_lossy(&bytes).into_owned(),
                title: None,
            })
        }
    }

    /// Fails the upsert calls `fails` selects, by call number.
    struct FakeSink {
        fails: fn(usize) -> bool,
        calls: AtomicUsize,
        accepted: AtomicUsize,
    }

    impl FakeSink {
        fn new(fails: fn(usize) -> bool) -> Self {
            Self {
                fails,
                calls: AtomicUsize::new(0),
                accepted: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VectorSink for FakeSink {
        async fn upsert(&self, records: &[ChunkRecord]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if (self.fails)(call) {
                return Err(AppError::VectorStore("HTTP 503".into()));
            }
            self.accepted.fetch_add(records.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> IndexerConfig {
        IndexerConfig {
            chunk_size: 16,
            chunk_overlap: 0,
            upsert_batch_size: 1,
            upsert_pause_ms: 0,
            item_pause_ms: 0,
            ..IndexerConfig::default()
        }
    }

    // Eight 7-character words: four 15-character chunks at size 16.
    const BODY: &str = "word001 word002 word003 word004 word005 word006 word007 word008";

    struct Fixture {
        _tmp: TempDir,
        store: Arc<LocalStore>,
        ledger: Arc<Ledger>,
        sink: Arc<FakeSink>,
        indexer: Indexer,
    }

    fn fixture(fails: fn(usize) -> bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let sink = Arc::new(FakeSink::new(fails));
        let indexer = Indexer::new(
            store.clone(),
            ledger.clone(),
            Arc::new(PlainText),
            sink.clone(),
            config(),
        );
        Fixture {
            _tmp: tmp,
            store,
            ledger,
            sink,
            indexer,
        }
    }

    async fn put(store: &LocalStore, key: &str, body: &str) {
        store
            .put(key, body.as_bytes().to_vec(), "application/pdf")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn partial_upsert_counts_as_success() {
        let f = fixture(|call| call % 2 == 0);
        put(&f.store, "documents/2023/01/a.pdf", BODY).await;

        let outcome = f.indexer.process_and_upsert("documents/2023/01/a.pdf").await;

        assert_eq!(outcome, Outcome::indexed());
        assert_eq!(f.sink.calls.load(Ordering::SeqCst), 4);
        assert_eq!(f.sink.accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_upserts_are_skipped() {
        let f = fixture(|_| true);
        put(&f.store, "documents/2023/01/a.pdf", BODY).await;

        let outcome = f.indexer.process_and_upsert("documents/2023/01/a.pdf").await;
        assert_eq!(outcome.status, LedgerStatus::Skipped);
        assert_eq!(outcome.label, "Upsert Failed");
    }

    #[tokio::test]
    async fn small_file_is_skipped_for_good() {
        let f = fixture(|_| false);
        put(&f.store, "documents/2023/01/tiny.pdf", "%PDF").await;
        let cancel = CancellationToken::new();

        let report = f.indexer.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.skipped, 1);
        let entry = f.ledger.get("documents/2023/01/tiny.pdf").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Skipped);
        assert_eq!(entry.file_type, "Small File");

        let report = f.indexer.run_cycle(&cancel).await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(f.sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_content_is_skipped() {
        let f = fixture(|_| false);
        let padded = format!("short{}", " ".repeat(60));
        put(&f.store, "documents/2023/01/b.pdf", &padded).await;

        let outcome = f.indexer.process_and_upsert("documents/2023/01/b.pdf").await;
        assert_eq!(outcome.label, "Low Content");
    }

    #[tokio::test]
    async fn download_errors_are_retried_within_budget() {
        let f = fixture(|_| false);
        f.ledger
            .record("documents/gone.pdf", LedgerStatus::Failed, "Download Error", Some("503"))
            .unwrap();
        let cancel = CancellationToken::new();

        let report = f.indexer.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 1);
        let entry = f.ledger.get("documents/gone.pdf").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.retry_count, 1);

        let report = f.indexer.run_cycle(&cancel).await.unwrap();
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn only_new_indexable_keys_are_processed() {
        let f = fixture(|_| false);
        put(&f.store, "documents/2023/01/a.pdf", BODY).await;
        put(&f.store, "documents/2023/01/notes.txt", BODY).await;
        put(&f.store, "documents/2023/01/c.PDF", BODY).await;
        f.ledger
            .record("documents/2023/01/a.pdf", LedgerStatus::Success, "PDF", None)
            .unwrap();

        let report = f.indexer.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.indexed, 1);
        assert!(f.ledger.contains("documents/2023/01/c.PDF").unwrap());
        assert!(!f.ledger.contains("documents/2023/01/notes.txt").unwrap());
    }

    #[tokio::test]
    async fn batch_size_leaves_the_rest_for_later() {
        let mut cfg = config();
        cfg.batch_size = 1;
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        put(&store, "documents/a.pdf", BODY).await;
        put(&store, "documents/b.pdf", BODY).await;
        let indexer = Indexer::new(
            store,
            Arc::new(Ledger::in_memory().unwrap()),
            Arc::new(PlainText),
            Arc::new(FakeSink::new(|_| false)),
            cfg,
        );

        let report = indexer.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.pending, 1);
    }

    #[tokio::test]
    async fn cancelled_loop_returns() {
        let f = fixture(|_| false);
        put(&f.store, "documents/a.pdf", BODY).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        f.indexer.run(&cancel).await;
        assert!(!f.ledger.contains("documents/a.pdf").unwrap());
    }
}
