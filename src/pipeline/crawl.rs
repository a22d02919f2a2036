// src/pipeline/crawl.rs

//! Judgment crawling pipeline.
//!
//! Walks root → year → month → alphabet partition → pagination → detail
//! page, handing every document link found on a detail page to the
//! [`AssetPersister`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{
    ArchivePeriod, AssetReference, Config, CrawlLevel, CrawlSummary, CrawlTarget, StoredRef,
    WorkerBackend,
};
use crate::services::links;
use crate::services::{
    AssetPersister, HttpDownloader, HttpWorkerFactory, Page, PageFetcher, PageSource,
    WorkerFactory, WorkerPool,
};
use crate::storage::{BlobStore, open_store};

/// Outcome of a walk.
#[derive(Debug, Default, Clone)]
pub struct CrawlReport {
    pub summary: CrawlSummary,
    /// Locations of every distinct stored asset
    pub stored: BTreeSet<String>,
}

/// Forward-only walker over the listing hierarchy.
pub struct CrawlWalker {
    pages: Arc<dyn PageSource>,
    persister: Arc<AssetPersister>,
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl CrawlWalker {
    pub fn new(
        pages: Arc<dyn PageSource>,
        persister: Arc<AssetPersister>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pages,
            persister,
            max_concurrent: max_concurrent.max(1),
            cancel,
        }
    }

    /// Walk everything reachable from `root_url`. Stops early, keeping what
    /// was stored so far, once the token is cancelled.
    pub async fn run(&self, root_url: &str) -> CrawlReport {
        let mut report = CrawlReport::default();
        let root = CrawlTarget::new(root_url, CrawlLevel::Root);

        if !self.cancelled() {
            if let Some(page) = self.fetch(&root).await {
                self.walk_root(&root, &page, &mut report).await;
            }
        }

        report.summary.stored = report.stored.len();
        report.summary.cancelled = self.cancel.is_cancelled();
        report
    }

    async fn walk_root(&self, root: &CrawlTarget, page: &Page, report: &mut CrawlReport) {
        let years = links::year_links(&root.url, &page.document()).or_base(&root.url, "year");

        if years.len() == 1 && years[0] == root.url {
            log::info!("No year listing on {}; walking it as the current month", root.url);
            let month = CrawlTarget::new(&root.url, CrawlLevel::Month);
            self.walk_month(&month, ArchivePeriod::current(), report).await;
            return;
        }

        log::info!("Found {} years", years.len());
        for year in root.children(years) {
            if self.cancelled() {
                return;
            }
            self.walk_year(&year, report).await;
        }
    }

    async fn walk_year(&self, year: &CrawlTarget, report: &mut CrawlReport) {
        let Some(page) = self.fetch(year).await else {
            return;
        };
        report.summary.years += 1;

        let period = ArchivePeriod::from_year_url(&year.url);
        let months = links::month_links(&year.url, &page.document()).or_base(&year.url, "month");

        if months.len() == 1 && months[0] == year.url {
            let month = CrawlTarget::new(&year.url, CrawlLevel::Month);
            self.walk_month(&month, period, report).await;
            return;
        }

        log::debug!("Year {}: {} months", period.year, months.len());
        for month in year.children(months) {
            if self.cancelled() {
                return;
            }
            let period = period.with_month_url(&month.url);
            self.walk_month(&month, period, report).await;
        }
    }

    async fn walk_month(&self, month: &CrawlTarget, period: ArchivePeriod, report: &mut CrawlReport) {
        report.summary.months += 1;
        log::info!("Walking {} ({})", month.url, period);

        for partition in month.children(links::alphabet_partitions(&month.url)) {
            if self.cancelled() {
                return;
            }
            self.walk_partition(&partition, period, report).await;
        }
    }

    async fn walk_partition(
        &self,
        partition: &CrawlTarget,
        period: ArchivePeriod,
        report: &mut CrawlReport,
    ) {
        let Some(first) = self.fetch(partition).await else {
            return;
        };
        let mut pages = links::pagination_links(&partition.url, &first.document())
            .or_base(&partition.url, "pagination");
        // The current page is often shown as plain text, not a link.
        if !pages.contains(&partition.url) {
            pages.insert(0, partition.url.clone());
        }

        for listing in partition.children(pages) {
            if self.cancelled() {
                return;
            }

            let fetched;
            let page = if listing.url == partition.url {
                &first
            } else {
                match self.fetch(&listing).await {
                    Some(page) => {
                        fetched = page;
                        &fetched
                    }
                    None => continue,
                }
            };
            report.summary.pages += 1;

            let details = links::detail_links(&listing.url, &page.document());
            log::debug!("{} detail pages on {}", details.len(), listing.url);
            let details = listing.children(details);
            self.walk_details(details, period, report).await;
        }
    }

    async fn walk_details(
        &self,
        details: Vec<CrawlTarget>,
        period: ArchivePeriod,
        report: &mut CrawlReport,
    ) {
        let results: Vec<(bool, Option<StoredRef>)> = stream::iter(details)
            .map(|detail| async move { self.resolve_detail(&detail, period).await })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (visited, stored) in results {
            if visited {
                report.summary.details += 1;
            }
            if let Some(stored) = stored {
                report.stored.insert(stored.location);
            }
        }
    }

    /// Fetch one detail page and persist its document. The flag tells
    /// whether the page was actually visited.
    async fn resolve_detail(
        &self,
        detail: &CrawlTarget,
        period: ArchivePeriod,
    ) -> (bool, Option<StoredRef>) {
        if self.cancelled() {
            return (false, None);
        }
        let Some(page) = self.fetch(detail).await else {
            return (false, None);
        };

        let Some(source_url) = links::asset_url(&page.document(), &detail.url) else {
            log::debug!("No document link on {}", detail.url);
            return (true, None);
        };

        let asset = AssetReference { source_url, period };
        (true, self.persister.persist(&asset).await)
    }

    async fn fetch(&self, target: &CrawlTarget) -> Option<Page> {
        match self.pages.fetch(&target.url).await {
            Ok(Some(page)) => Some(page),
            Ok(None) => {
                log::debug!("Skipping {:?} {} (not available)", target.level, target.url);
                None
            }
            Err(e) => {
                log::warn!("Failed to fetch {:?} {}: {}", target.level, target.url, e);
                None
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run a full crawl from `root_url` and write the stored references to
/// `output`.
pub async fn run_crawler(
    config: &Config,
    root_url: &str,
    output: &Path,
    cancel: CancellationToken,
) -> Result<CrawlReport> {
    let start_time = Utc::now();
    log::info!("Starting crawl of {}", root_url);

    let store = open_store(&config.storage).await?;
    store.verify_access().await?;
    log::info!("Storage OK: {}", store.location(&config.storage.folder));

    let report = match config.pool.backend {
        WorkerBackend::Http => {
            let factory = HttpWorkerFactory::new(config.crawler.clone());
            walk_with(factory, config, store, root_url, cancel).await?
        }
        #[cfg(feature = "browser")]
        WorkerBackend::Browser => {
            let factory = crate::services::ChromeWorkerFactory::new(config.crawler.clone());
            walk_with(factory, config, store, root_url, cancel).await?
        }
        #[cfg(not(feature = "browser"))]
        WorkerBackend::Browser => {
            return Err(AppError::config(
                "browser backend requires building with the `browser` feature",
            ));
        }
    };

    write_output(output, &report.stored).await?;

    let elapsed = Utc::now() - start_time;
    let summary = &report.summary;
    log::info!(
        "Crawl {} in {}s: {} years, {} months, {} pages, {} detail pages, {} documents stored",
        if summary.cancelled { "cancelled" } else { "finished" },
        elapsed.num_seconds(),
        summary.years,
        summary.months,
        summary.pages,
        summary.details,
        summary.stored
    );
    log::info!("Stored references written to {}", output.display());

    Ok(report)
}

async fn walk_with<F: WorkerFactory>(
    factory: F,
    config: &Config,
    store: Arc<dyn BlobStore>,
    root_url: &str,
    cancel: CancellationToken,
) -> Result<CrawlReport> {
    let downloader = Arc::new(HttpDownloader::new(&config.crawler)?);
    let persister = Arc::new(AssetPersister::new(store, downloader, &config.storage.folder));

    let pool = Arc::new(WorkerPool::new(factory, config.pool.clone()));
    let swept = pool.sweep_orphans();
    if swept > 0 {
        log::info!("Cleaned up {} leftovers from earlier runs", swept);
    }

    let pages = Arc::new(PageFetcher::new(
        Arc::clone(&pool),
        &config.crawler,
        &config.pool,
    ));
    let walker = CrawlWalker::new(pages, persister, config.crawler.max_concurrent, cancel);

    let report = walker.run(root_url).await;
    pool.shutdown().await;
    Ok(report)
}

/// One stored reference per line, sorted.
pub async fn write_output(path: &Path, stored: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = String::new();
    for location in stored {
        body.push_str(location);
        body.push('\n');
    }
    tokio::fs::write(path, body)
        .await
        .map_err(|e| AppError::crawl(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::services::persister::tests::FakeSource;
    use crate::storage::LocalStore;

    const ROOT: &str = "https://example.org/judgments/";

    /// Serves canned HTML and records every requested URL.
    #[derive(Default)]
    struct FakeSite {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeSite {
        fn with(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for FakeSite {
        async fn fetch(&self, url: &str) -> Result<Option<Page>> {
            self.requested.lock().unwrap().push(url.to_string());
            Ok(self.pages.get(url).map(|html| Page {
                url: url.to_string(),
                html: html.clone(),
            }))
        }
    }

    fn detail_page(case: &str) -> String {
        format!(
            r#"<html><body><a class="btn btn-primary btn-shrink-sm"
                href="/akn/ke/judgment/kehc/2023/{case}/eng@2023-01-10/source">Download PDF (120 KB)</a>
            </body></html>"#
        )
    }

    fn site() -> FakeSite {
        let year_nav = r#"<ul class="year-nav"><li><a href="/judgments/2023/">2023</a></li></ul>"#;
        let month_nav = r#"<ul class="year-nav"><li><a href="/judgments/2023/1/">January</a></li></ul>"#;
        let listing = r#"<table>
            <tr><td class="cell-title"><a href="/akn/ke/judgment/kehc/2023/77/eng@2023-01-10">A v B</a></td></tr>
            <tr><td class="cell-title"><a href="/akn/ke/judgment/kehc/2023/78/eng@2023-01-10">C v D</a></td></tr>
            <tr><td>no link</td></tr>
        </table>"#;

        // Both judgments point at the same document.
        FakeSite::default()
            .with(ROOT, &format!("<html><body>{year_nav}</body></html>"))
            .with(
                "https://example.org/judgments/2023/",
                &format!("<html><body>{year_nav}{month_nav}</body></html>"),
            )
            .with(
                "https://example.org/judgments/2023/1/?alphabet=c",
                &format!("<html><body>{listing}</body></html>"),
            )
            .with(
                "https://example.org/akn/ke/judgment/kehc/2023/77/eng@2023-01-10",
                &detail_page("77"),
            )
            .with(
                "https://example.org/akn/ke/judgment/kehc/2023/78/eng@2023-01-10",
                &detail_page("77"),
            )
    }

    #[tokio::test]
    async fn walk_stores_each_document_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let source = Arc::new(FakeSource::new(b"%PDF-1.4 judgment"));
        let persister = Arc::new(AssetPersister::new(store.clone(), source.clone(), "documents"));
        let site = Arc::new(site());

        let walker = CrawlWalker::new(site.clone(), persister, 3, CancellationToken::new());
        let report = walker.run(ROOT).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.stored.len(), 1);
        assert!(store.exists("documents/2023/01/kehc_2023_77.pdf").await.unwrap());
        assert_eq!(
            report.summary,
            CrawlSummary {
                years: 1,
                months: 1,
                pages: 1,
                details: 2,
                stored: 1,
                cancelled: false,
            }
        );

        // The partition page doubles as its own first listing page.
        let requested = site.requested();
        let partition = "https://example.org/judgments/2023/1/?alphabet=c";
        assert_eq!(requested.iter().filter(|u| *u == partition).count(), 1);
        let partitions = requested.iter().filter(|u| u.contains("?alphabet=")).count();
        assert_eq!(partitions, 26);
    }

    #[tokio::test]
    async fn root_without_years_is_walked_as_a_month() {
        let site = Arc::new(FakeSite::default().with(ROOT, "<html><body></body></html>"));
        let tmp = TempDir::new().unwrap();
        let persister = Arc::new(AssetPersister::new(
            Arc::new(LocalStore::new(tmp.path())),
            Arc::new(FakeSource::new(b"x")),
            "documents",
        ));

        let walker = CrawlWalker::new(site.clone(), persister, 3, CancellationToken::new());
        let report = walker.run(ROOT).await;

        assert_eq!(report.summary.years, 0);
        assert_eq!(report.summary.months, 1);
        let requested = site.requested();
        assert_eq!(requested[1], format!("{ROOT}?alphabet=a"));
        assert_eq!(requested.last().unwrap(), &format!("{ROOT}?alphabet=z"));
    }

    fn listing_row(case: &str) -> String {
        format!(
            r#"<tr><td class="cell-title"><a href="/akn/ke/judgment/kehc/2023/{case}/eng@2023-01-10">Case {case}</a></td></tr>"#
        )
    }

    fn detail_url(case: &str) -> String {
        format!("https://example.org/akn/ke/judgment/kehc/2023/{case}/eng@2023-01-10")
    }

    #[tokio::test]
    async fn year_without_months_is_walked_with_its_year() {
        let year_nav = r#"<ul class="year-nav"><li><a href="/judgments/2023/">2023</a></li></ul>"#;
        let site = Arc::new(
            FakeSite::default()
                .with(ROOT, &format!("<html><body>{year_nav}</body></html>"))
                .with(
                    "https://example.org/judgments/2023/",
                    &format!("<html><body>{year_nav}</body></html>"),
                )
                .with(
                    "https://example.org/judgments/2023/?alphabet=c",
                    &format!("<html><body><table>{}</table></body></html>", listing_row("5")),
                )
                .with(&detail_url("5"), &detail_page("5")),
        );
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let persister = Arc::new(AssetPersister::new(
            store.clone(),
            Arc::new(FakeSource::new(b"%PDF-1.4")),
            "documents",
        ));

        let report = CrawlWalker::new(site.clone(), persister, 3, CancellationToken::new())
            .run(ROOT)
            .await;

        assert_eq!(report.summary.years, 1);
        assert_eq!(report.summary.months, 1);
        assert_eq!(report.summary.stored, 1);
        let month = ArchivePeriod::current().month;
        let key = format!("documents/2023/{month:02}/kehc_2023_5.pdf");
        assert!(store.exists(&key).await.unwrap());

        let partitions: Vec<String> = site
            .requested()
            .into_iter()
            .filter(|u| u.contains("?alphabet="))
            .collect();
        assert_eq!(partitions.len(), 26);
        assert!(partitions.iter().all(|u| u.starts_with("https://example.org/judgments/2023/?")));
    }

    #[tokio::test]
    async fn partition_pages_are_all_walked_when_current_page_is_not_a_link() {
        let year_nav = r#"<ul class="year-nav"><li><a href="/judgments/2023/">2023</a></li></ul>"#;
        let month_nav = r#"<ul class="year-nav"><li><a href="/judgments/2023/1/">January</a></li></ul>"#;
        let pagination = r#"<ul class="pagination">
            <li class="active"><span>1</span></li>
            <li><a href="?alphabet=c&page=2">2</a></li>
        </ul>"#;
        let partition = "https://example.org/judgments/2023/1/?alphabet=c";
        let second = "https://example.org/judgments/2023/1/?alphabet=c&page=2";
        let site = Arc::new(
            FakeSite::default()
                .with(ROOT, &format!("<html><body>{year_nav}</body></html>"))
                .with(
                    "https://example.org/judgments/2023/",
                    &format!("<html><body>{year_nav}{month_nav}</body></html>"),
                )
                .with(
                    partition,
                    &format!(
                        "<html><body>{pagination}<table>{}</table></body></html>",
                        listing_row("1")
                    ),
                )
                .with(
                    second,
                    &format!("<html><body><table>{}</table></body></html>", listing_row("2")),
                )
                .with(&detail_url("1"), &detail_page("1"))
                .with(&detail_url("2"), &detail_page("2")),
        );
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(tmp.path()));
        let persister = Arc::new(AssetPersister::new(
            store.clone(),
            Arc::new(FakeSource::new(b"%PDF-1.4")),
            "documents",
        ));

        let report = CrawlWalker::new(site.clone(), persister, 3, CancellationToken::new())
            .run(ROOT)
            .await;

        assert_eq!(report.summary.pages, 2);
        assert_eq!(report.summary.details, 2);
        assert_eq!(report.summary.stored, 2);
        assert!(store.exists("documents/2023/01/kehc_2023_1.pdf").await.unwrap());
        assert!(store.exists("documents/2023/01/kehc_2023_2.pdf").await.unwrap());

        let requested = site.requested();
        assert_eq!(requested.iter().filter(|u| *u == partition).count(), 1);
        assert_eq!(requested.iter().filter(|u| *u == second).count(), 1);
    }

    #[tokio::test]
    async fn cancelled_walk_fetches_nothing() {
        let tmp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::new(b"x"));
        let persister = Arc::new(AssetPersister::new(
            Arc::new(LocalStore::new(tmp.path())),
            source.clone(),
            "documents",
        ));
        let site = Arc::new(site());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = CrawlWalker::new(site.clone(), persister, 3, cancel)
            .run(ROOT)
            .await;

        assert!(report.summary.cancelled);
        assert!(report.stored.is_empty());
        assert!(site.requested().is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn output_lists_references_sorted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("stored_links.txt");
        let stored: BTreeSet<String> = ["s3://b/documents/2023/02/x.pdf", "s3://b/documents/2023/01/y.pdf"]
            .into_iter()
            .map(String::from)
            .collect();

        write_output(&path, &stored).await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            body,
            "s3://b/documents/2023/01/y.pdf\ns3://b/documents/2023/02/x.pdf\n"
        );
    }
}
