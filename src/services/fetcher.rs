// src/services/fetcher.rs

//! Page fetching through the worker pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::Html;

use crate::error::{AppError, Result};
use crate::models::{CrawlerConfig, PoolConfig};
use crate::services::pool::WorkerPool;
use crate::services::worker::{PageWorker, WorkerFactory};
use crate::utils::retry::RetryPolicy;

/// A fetched page. Parse it with [`Page::document`] where needed; the
/// parsed tree is not `Send` and must not be held across awaits.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub html: String,
}

impl Page {
    pub fn document(&self) -> Html {
        Html::parse_document(&self.html)
    }
}

/// Anything that can turn a URL into a page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// `Ok(None)` means the page is structurally absent (HTTP 4xx) and the
    /// subtree below it should be skipped.
    async fn fetch(&self, url: &str) -> Result<Option<Page>>;
}

/// [`PageSource`] backed by a [`WorkerPool`].
pub struct PageFetcher<F: WorkerFactory> {
    pool: Arc<WorkerPool<F>>,
    policy: RetryPolicy,
    marker: String,
    timeout: Duration,
    acquire_timeout: Duration,
    delay: Duration,
}

impl<F: WorkerFactory> PageFetcher<F> {
    pub fn new(pool: Arc<WorkerPool<F>>, crawler: &CrawlerConfig, pool_config: &PoolConfig) -> Self {
        Self {
            pool,
            policy: crawler.fetch_policy(),
            marker: crawler.content_marker.clone(),
            timeout: crawler.timeout(),
            acquire_timeout: pool_config.acquire_timeout(),
            delay: Duration::from_millis(crawler.request_delay_ms),
        }
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt(&self, url: &str) -> Result<Page> {
        let mut worker = self.pool.acquire(self.acquire_timeout).await?;

        match worker.render(url, &self.marker, self.timeout).await {
            Ok(rendered) => {
                self.pool.release(worker).await;
                match rendered.status {
                    Some(status) if status >= 400 => Err(AppError::Status {
                        url: url.to_string(),
                        status,
                    }),
                    _ => Ok(Page {
                        url: url.to_string(),
                        html: rendered.html,
                    }),
                }
            }
            Err(e) => {
                if e.is_connection_related() {
                    log::warn!("Worker {} lost its connection: {}", worker.id(), e);
                    self.pool.discard(worker).await;
                } else {
                    self.pool.release(worker).await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<F: WorkerFactory> PageSource for PageFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<Option<Page>> {
        let result = self
            .policy
            .run(
                url,
                move |_| self.attempt(url),
                AppError::is_transient,
            )
            .await;

        match result {
            Ok(page) => {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                Ok(Some(page))
            }
            Err(e) => match e.client_status() {
                Some(status) => {
                    log::debug!("Skipping {} (HTTP {})", url, status);
                    Ok(None)
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::*;
    use crate::services::pool::tests::test_config;
    use crate::services::worker::RenderedPage;

    /// Worker replaying a script of outcomes, shared across recreated workers.
    struct ScriptedWorker {
        id: usize,
        dir: PathBuf,
        script: Arc<Mutex<Vec<Result<RenderedPage>>>>,
    }

    #[async_trait]
    impl PageWorker for ScriptedWorker {
        fn id(&self) -> usize {
            self.id
        }

        fn scratch_dir(&self) -> &Path {
            &self.dir
        }

        async fn render(&mut self, _: &str, _: &str, _: Duration) -> Result<RenderedPage> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(RenderedPage {
                    status: Some(200),
                    html: "<html><body>ok</body></html>".into(),
                });
            }
            script.remove(0)
        }

        async fn is_alive(&mut self) -> bool {
            true
        }

        async fn shutdown(&mut self) {}
    }

    struct ScriptedFactory {
        script: Arc<Mutex<Vec<Result<RenderedPage>>>>,
        created: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl WorkerFactory for ScriptedFactory {
        type Worker = ScriptedWorker;

        async fn create(&self, id: usize, dir: &Path) -> Result<ScriptedWorker> {
            *self.created.lock().unwrap() += 1;
            Ok(ScriptedWorker {
                id,
                dir: dir.to_path_buf(),
                script: Arc::clone(&self.script),
            })
        }

        fn sweep_orphans(&self, _: &str) -> usize {
            0
        }
    }

    fn fetcher(script: Vec<Result<RenderedPage>>) -> (PageFetcher<ScriptedFactory>, Arc<Mutex<usize>>) {
        let created = Arc::new(Mutex::new(0));
        let factory = ScriptedFactory {
            script: Arc::new(Mutex::new(script)),
            created: Arc::clone(&created),
        };
        let pool = Arc::new(WorkerPool::new(factory, test_config(1)));
        let mut crawler = CrawlerConfig::default();
        crawler.request_delay_ms = 0;
        let fetcher = PageFetcher::new(pool, &crawler, &PoolConfig::default())
            .with_policy(RetryPolicy::fixed(3, Duration::ZERO));
        (fetcher, created)
    }

    fn status(code: u16) -> Result<RenderedPage> {
        Ok(RenderedPage {
            status: Some(code),
            html: String::new(),
        })
    }

    #[tokio::test]
    async fn client_errors_skip_without_retry() {
        let (fetcher, _) = fetcher(vec![status(404), status(200)]);
        assert!(fetcher.fetch("https://example.org/x").await.unwrap().is_none());
        assert_eq!(fetcher.pool.live_workers(), 1);
        let page = fetcher.fetch("https://example.org/y").await.unwrap();
        assert!(page.is_some());
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (fetcher, _) = fetcher(vec![status(503), status(502)]);
        let page = fetcher.fetch("https://example.org/x").await.unwrap().unwrap();
        assert!(page.html.contains("ok"));
    }

    #[tokio::test]
    async fn connection_failures_replace_the_worker() {
        let (fetcher, created) = fetcher(vec![Err(AppError::worker("websocket disconnected"))]);
        let page = fetcher.fetch("https://example.org/x").await.unwrap();
        assert!(page.is_some());
        assert_eq!(*created.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let (fetcher, _) = fetcher(vec![status(500), status(500), status(500)]);
        let err = fetcher.fetch("https://example.org/x").await.unwrap_err();
        assert!(matches!(err, AppError::Status { status: 500, .. }));
    }
}
