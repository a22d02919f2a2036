// src/services/worker.rs

//! Page workers: the expensive, poolable things that turn a URL into HTML.
//!
//! `HttpWorker` is a plain reqwest session. `ChromeWorker` (feature
//! `browser`) drives a headless Chrome with its own profile directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};

use crate::error::{AppError, Result};
use crate::models::CrawlerConfig;
use crate::utils::http::create_async_client;

/// HTML produced by a worker.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Final HTTP status when the backend knows it
    pub status: Option<u16>,
    pub html: String,
}

/// A single fetch-capable worker.
#[async_trait]
pub trait PageWorker: Send + Sync + 'static {
    fn id(&self) -> usize;

    /// Scratch directory owned by this worker.
    fn scratch_dir(&self) -> &Path;

    /// Load `url` and wait up to `timeout` for `marker` to appear.
    async fn render(&mut self, url: &str, marker: &str, timeout: Duration)
    -> Result<RenderedPage>;

    /// Cheap liveness check.
    async fn is_alive(&mut self) -> bool;

    /// Release the worker's resources.
    async fn shutdown(&mut self);
}

/// Creates workers for a pool.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: PageWorker;

    /// Create worker `id` using `scratch_dir` for its private state.
    async fn create(&self, id: usize, scratch_dir: &Path) -> Result<Self::Worker>;

    /// Kill leftover worker processes and remove leftover scratch
    /// directories whose name starts with `prefix`. Returns the number of
    /// items cleaned up.
    fn sweep_orphans(&self, prefix: &str) -> usize {
        remove_scratch_dirs(prefix)
    }
}

/// Whether `marker` matches an element of `html`.
pub fn has_marker(html: &str, marker: &str) -> Result<bool> {
    let selector =
        Selector::parse(marker).map_err(|e| AppError::selector(marker, format!("{e:?}")))?;
    Ok(Html::parse_document(html).select(&selector).next().is_some())
}

/// HTTP status reported by a browser, if it is a real one.
#[cfg_attr(not(feature = "browser"), allow(dead_code))]
pub(crate) fn status_code(status: i64) -> Option<u16> {
    u16::try_from(status).ok().filter(|s| (100..600).contains(s))
}

/// Kill every process whose command line mentions `needle`.
pub fn kill_processes_matching(needle: &str) -> usize {
    let system = sysinfo::System::new_all();
    let own_pid = sysinfo::get_current_pid().ok();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own_pid {
            continue;
        }
        let matches = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(needle));
        if matches && process.kill() {
            log::debug!("Killed orphaned worker process {}", pid);
            killed += 1;
        }
    }
    killed
}

/// Remove scratch directories in the temp dir whose name starts with `prefix`.
pub fn remove_scratch_dirs(prefix: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
    removed
}

// --- HTTP worker ---

/// Worker backed by its own HTTP session.
pub struct HttpWorker {
    id: usize,
    client: reqwest::Client,
    scratch_dir: PathBuf,
    closed: bool,
}

#[async_trait]
impl PageWorker for HttpWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    async fn render(
        &mut self,
        url: &str,
        marker: &str,
        timeout: Duration,
    ) -> Result<RenderedPage> {
        if self.closed {
            return Err(AppError::worker(format!("worker {} connection closed", self.id)));
        }

        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(RenderedPage {
                status: Some(status),
                html: String::new(),
            });
        }

        let html = response.text().await?;
        if !has_marker(&html, marker)? {
            return Err(AppError::ContentTimeout {
                url: url.to_string(),
                marker: marker.to_string(),
                secs: timeout.as_secs(),
            });
        }

        Ok(RenderedPage {
            status: Some(status),
            html,
        })
    }

    async fn is_alive(&mut self) -> bool {
        !self.closed
    }

    async fn shutdown(&mut self) {
        self.closed = true;
    }
}

/// Builds [`HttpWorker`]s from the crawler settings.
pub struct HttpWorkerFactory {
    config: CrawlerConfig,
}

impl HttpWorkerFactory {
    pub fn new(config: CrawlerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerFactory for HttpWorkerFactory {
    type Worker = HttpWorker;

    async fn create(&self, id: usize, scratch_dir: &Path) -> Result<HttpWorker> {
        Ok(HttpWorker {
            id,
            client: create_async_client(&self.config)?,
            scratch_dir: scratch_dir.to_path_buf(),
            closed: false,
        })
    }
}

// --- Chrome worker ---

#[cfg(feature = "browser")]
pub use chrome::{ChromeWorker, ChromeWorkerFactory};

#[cfg(feature = "browser")]
mod chrome {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use async_trait::async_trait;
    use chromiumoxide::{Browser, BrowserConfig};
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    use super::{
        PageWorker, RenderedPage, WorkerFactory, kill_processes_matching, remove_scratch_dirs,
        status_code,
    };
    use crate::error::{AppError, Result};
    use crate::models::CrawlerConfig;

    const MARKER_POLL: Duration = Duration::from_millis(250);

    /// Headless Chrome with a private profile directory.
    pub struct ChromeWorker {
        id: usize,
        browser: Browser,
        handler: JoinHandle<()>,
        scratch_dir: PathBuf,
    }

    impl ChromeWorker {
        async fn load(&self, url: &str, marker: &str, timeout: Duration) -> Result<RenderedPage> {
            let page = self.browser.new_page("about:blank").await.map_err(AppError::worker)?;

            let result = async {
                page.goto(url).await.map_err(AppError::worker)?;
                let request = page
                    .wait_for_navigation_response()
                    .await
                    .map_err(AppError::worker)?;
                let status = request
                    .and_then(|r| r.response.as_ref().map(|response| response.status))
                    .and_then(status_code);

                // Error pages never carry the listing marker.
                if status.is_some_and(|s| s >= 400) {
                    let html = page.content().await.map_err(AppError::worker)?;
                    return Ok(RenderedPage { status, html });
                }

                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if page.find_element(marker).await.is_ok() {
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AppError::ContentTimeout {
                            url: url.to_string(),
                            marker: marker.to_string(),
                            secs: timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(MARKER_POLL).await;
                }
                let html = page.content().await.map_err(AppError::worker)?;
                Ok(RenderedPage { status, html })
            }
            .await;

            if let Err(e) = page.close().await {
                log::debug!("Worker {} failed to close tab: {}", self.id, e);
            }
            result
        }
    }

    #[async_trait]
    impl PageWorker for ChromeWorker {
        fn id(&self) -> usize {
            self.id
        }

        fn scratch_dir(&self) -> &Path {
            &self.scratch_dir
        }

        async fn render(
            &mut self,
            url: &str,
            marker: &str,
            timeout: Duration,
        ) -> Result<RenderedPage> {
            tokio::time::timeout(timeout + MARKER_POLL, self.load(url, marker, timeout))
                .await
                .map_err(|_| AppError::ContentTimeout {
                    url: url.to_string(),
                    marker: marker.to_string(),
                    secs: timeout.as_secs(),
                })?
        }

        async fn is_alive(&mut self) -> bool {
            !self.handler.is_finished() && self.browser.version().await.is_ok()
        }

        async fn shutdown(&mut self) {
            if let Err(e) = self.browser.close().await {
                log::debug!("Worker {} close failed: {}", self.id, e);
            }
            if let Err(e) = self.browser.wait().await {
                log::debug!("Worker {} did not exit cleanly: {}", self.id, e);
            }
            self.handler.abort();
        }
    }

    /// Launches [`ChromeWorker`]s.
    pub struct ChromeWorkerFactory {
        config: CrawlerConfig,
    }

    impl ChromeWorkerFactory {
        pub fn new(config: CrawlerConfig) -> Self {
            Self { config }
        }
    }

    #[async_trait]
    impl WorkerFactory for ChromeWorkerFactory {
        type Worker = ChromeWorker;

        async fn create(&self, id: usize, scratch_dir: &Path) -> Result<ChromeWorker> {
            let browser_config = BrowserConfig::builder()
                .user_data_dir(scratch_dir)
                .request_timeout(self.config.timeout())
                .arg("--headless=new")
                .arg("--no-sandbox")
                .arg("--disable-gpu")
                .arg("--disable-dev-shm-usage")
                .arg(format!("--user-agent={}", self.config.user_agent))
                .build()
                .map_err(AppError::worker)?;

            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(AppError::worker)?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            log::debug!("Launched Chrome worker {} in {}", id, scratch_dir.display());
            Ok(ChromeWorker {
                id,
                browser,
                handler,
                scratch_dir: scratch_dir.to_path_buf(),
            })
        }

        fn sweep_orphans(&self, prefix: &str) -> usize {
            kill_processes_matching(prefix) + remove_scratch_dirs(prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detection() {
        assert!(has_marker("<html><body><p>x</p></body></html>", "body").unwrap());
        assert!(!has_marker("<div>x</div>", "table.listing").unwrap());
        assert!(has_marker("<div>x</div>", "[[").is_err());
    }

    #[test]
    fn browser_status_is_kept_only_when_real() {
        assert_eq!(status_code(200), Some(200));
        assert_eq!(status_code(404), Some(404));
        assert_eq!(status_code(0), None);
        assert_eq!(status_code(-1), None);
        assert_eq!(status_code(70_000), None);
    }

    #[test]
    fn scratch_dirs_with_prefix_are_removed() {
        let prefix = format!("harvester_sweep_test_{}_", std::process::id());
        let dir = std::env::temp_dir().join(format!("{prefix}0"));
        std::fs::create_dir_all(dir.join("Default")).unwrap();

        assert_eq!(remove_scratch_dirs(&prefix), 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn http_worker_stops_after_shutdown() {
        let factory = HttpWorkerFactory::new(CrawlerConfig::default());
        let mut worker = factory.create(7, Path::new("/tmp")).await.unwrap();
        assert_eq!(worker.id(), 7);
        assert!(worker.is_alive().await);

        worker.shutdown().await;
        assert!(!worker.is_alive().await);
        let err = worker
            .render("https://example.org/", "body", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_connection_related());
    }
}
