// src/services/pool.rs

//! Bounded pool of page workers.
//!
//! Workers are created lazily up to `size`, handed out one caller at a
//! time, health-checked when returned, and torn down deterministically on
//! shutdown together with any processes or scratch directories they left
//! behind.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{AppError, Result};
use crate::models::PoolConfig;
use crate::services::worker::{PageWorker, WorkerFactory, kill_processes_matching};

/// A worker checked out of the pool. Hand it back with
/// [`WorkerPool::release`] or [`WorkerPool::discard`].
pub struct PooledWorker<W> {
    worker: W,
    _permit: OwnedSemaphorePermit,
}

impl<W> Deref for PooledWorker<W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W> DerefMut for PooledWorker<W> {
    fn deref_mut(&mut self) -> &mut W {
        &mut self.worker
    }
}

/// Pool of workers built by `F`.
pub struct WorkerPool<F: WorkerFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<F::Worker>>,
    permits: Arc<Semaphore>,
    /// Scratch directories of every live worker, by id
    registry: Mutex<HashMap<usize, PathBuf>>,
    next_id: AtomicUsize,
    closed: AtomicBool,
}

impl<F: WorkerFactory> WorkerPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(size)),
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Clean up what a previous run may have left behind.
    pub fn sweep_orphans(&self) -> usize {
        let swept = self.factory.sweep_orphans(&self.scratch_prefix());
        if swept > 0 {
            log::info!("Swept {} orphaned worker resources", swept);
        }
        swept
    }

    /// Number of workers currently alive (idle or checked out).
    #[cfg(test)]
    pub fn live_workers(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Take a worker, creating one if the pool is under capacity.
    ///
    /// Waits at most `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledWorker<F::Worker>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Pool("pool is shut down".into()));
        }

        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AppError::Pool("pool is shut down".into())),
            Err(_) => {
                return Err(AppError::Pool(format!(
                    "no worker available within {:?}",
                    timeout
                )));
            }
        };

        let idle = self.pop_idle();
        let worker = match idle {
            Some(worker) => worker,
            None => self.create_worker().await?,
        };

        Ok(PooledWorker {
            worker,
            _permit: permit,
        })
    }

    /// Return a worker. Dead workers are torn down instead of re-queued.
    pub async fn release(&self, mut pooled: PooledWorker<F::Worker>) {
        if self.closed.load(Ordering::SeqCst) {
            self.teardown(&mut pooled.worker).await;
            return;
        }

        if pooled.worker.is_alive().await {
            let PooledWorker { worker, _permit } = pooled;
            if let Ok(mut idle) = self.idle.lock() {
                idle.push_back(worker);
            }
        } else {
            log::warn!(
                "Worker {} failed its health check, replacing it",
                pooled.worker.id()
            );
            self.teardown(&mut pooled.worker).await;
        }
    }

    /// Tear a worker down unconditionally.
    pub async fn discard(&self, mut pooled: PooledWorker<F::Worker>) {
        log::debug!("Discarding worker {}", pooled.worker.id());
        self.teardown(&mut pooled.worker).await;
    }

    /// Refuse new acquisitions and destroy every worker.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        let drained: Vec<F::Worker> = self
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        let idle_count = drained.len();
        for mut worker in drained {
            self.teardown(&mut worker).await;
        }

        // Workers still checked out: kill their processes and scratch dirs.
        let leftovers: Vec<(usize, PathBuf)> = self
            .registry
            .lock()
            .map(|mut registry| registry.drain().collect())
            .unwrap_or_default();
        for (id, dir) in &leftovers {
            let killed = kill_processes_matching(&dir.to_string_lossy());
            log::debug!("Force-stopped worker {} ({} processes)", id, killed);
            remove_dir(dir);
        }

        let swept = self.factory.sweep_orphans(&self.scratch_prefix());
        log::info!(
            "Worker pool shut down: {} idle, {} forced, {} orphans swept",
            idle_count,
            leftovers.len(),
            swept
        );
    }

    fn pop_idle(&self) -> Option<F::Worker> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop_front())
    }

    /// Prefix of every scratch directory this process creates.
    fn scratch_prefix(&self) -> String {
        self.config.scratch_prefix.clone()
    }

    async fn create_worker(&self) -> Result<F::Worker> {
        let policy = self.config.create_policy();
        policy
            .run(
                "create worker",
                move |_| async move {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let dir = std::env::temp_dir().join(format!(
                        "{}{}_{}",
                        self.config.scratch_prefix,
                        std::process::id(),
                        id
                    ));
                    tokio::fs::create_dir_all(&dir).await?;

                    match self.factory.create(id, &dir).await {
                        Ok(worker) => {
                            if let Ok(mut registry) = self.registry.lock() {
                                registry.insert(id, dir);
                            }
                            log::debug!("Created worker {}", id);
                            Ok(worker)
                        }
                        Err(e) => {
                            log::warn!("Worker {} creation failed: {}", id, e);
                            remove_dir(&dir);
                            Err(e)
                        }
                    }
                },
                |_| true,
            )
            .await
    }

    async fn teardown(&self, worker: &mut F::Worker) {
        worker.shutdown().await;
        let dir = self
            .registry
            .lock()
            .ok()
            .and_then(|mut registry| registry.remove(&worker.id()));
        remove_dir(dir.as_deref().unwrap_or(worker.scratch_dir()));
    }
}

fn remove_dir(dir: &std::path::Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
