//! The store handle: engine + pending queue + write worker.
//!
//! **Write path**: `put`/`delete` enqueue and return; the worker applies later
//! **Read path**: `get`/`exists` go straight to the engine
//! **Durability**: `sync` fsyncs what the engine already applied
//!
//! A successful `put` means "accepted", not "applied" and not "durable".
//! Call [`SpoolStore::wait_for_drain`] then [`SpoolStore::sync`] to reach a
//! durable point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use spoolstore_engine::{EngineLocation, LogEngine};
use tracing::{error, info, warn};

use crate::adapter::{Engine, EngineAdapter};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::queue::{Operation, PendingQueue};
use crate::worker::{spawn_worker, PipelineStats, StatsSnapshot, WorkerHandle};

/// Lifecycle of the write worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

/// Key-value store whose writes are applied asynchronously by one worker.
///
/// All methods take `&self`; share the store across threads with `Arc` or
/// scoped threads. Writes from one thread are applied in the order that
/// thread issued them.
pub struct SpoolStore<E: Engine = LogEngine> {
    adapter: Arc<EngineAdapter<E>>,
    queue: Arc<PendingQueue>,
    stats: Arc<PipelineStats>,
    /// None once closed or aborted
    worker: Mutex<Option<WorkerHandle>>,
    closed: AtomicBool,
    config: StoreConfig,
}

impl SpoolStore<LogEngine> {
    /// Open or create database `db_name` in file `file_name`, keeping the
    /// lock file in `directory` and the WAL in `log_directory`.
    pub fn open(
        directory: impl Into<PathBuf>,
        log_directory: impl Into<PathBuf>,
        file_name: &str,
        db_name: &str,
    ) -> StoreResult<Self> {
        Self::open_with_config(directory, log_directory, file_name, db_name, StoreConfig::default())
    }

    /// Data and logs in the same directory.
    pub fn open_in(directory: impl Into<PathBuf>, file_name: &str, db_name: &str) -> StoreResult<Self> {
        let directory = directory.into();
        Self::open(directory.clone(), directory, file_name, db_name)
    }

    pub fn open_with_config(
        directory: impl Into<PathBuf>,
        log_directory: impl Into<PathBuf>,
        file_name: &str,
        db_name: &str,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        config.validate()?;
        let location = EngineLocation::new(directory, log_directory, file_name, db_name);
        let adapter = EngineAdapter::open(location, config.engine.clone())?;
        Self::start(adapter, config)
    }
}

impl<E: Engine> SpoolStore<E> {
    /// Run the pipeline over an already opened engine.
    pub fn with_engine(engine: E, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        Self::start(EngineAdapter::new(engine), config)
    }

    fn start(adapter: EngineAdapter<E>, config: StoreConfig) -> StoreResult<Self> {
        let adapter = Arc::new(adapter);
        let queue = Arc::new(PendingQueue::new(config.queue_capacity));
        let stats = Arc::new(PipelineStats::new());

        let worker = match spawn_worker(
            Arc::clone(&adapter),
            Arc::clone(&queue),
            Arc::clone(&stats),
            config.poll_interval,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(close_err) = adapter.close() {
                    error!(error = %close_err, "engine close after failed worker start also failed");
                }
                return Err(e);
            }
        };

        info!(
            queue_capacity = config.queue_capacity,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "store opened"
        );

        Ok(Self {
            adapter,
            queue,
            stats,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            config,
        })
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn enqueue(&self, op: Operation) -> StoreResult<()> {
        self.ensure_open()?;
        self.queue.push(op)?;
        self.stats.record_enqueued();
        Ok(())
    }

    /// Enqueue an upsert. Blocks while the pending queue is full.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> StoreResult<()> {
        self.enqueue(Operation::put(key, value))
    }

    /// Enqueue a delete. Blocks while the pending queue is full. Deleting an
    /// absent key is not an error.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> StoreResult<()> {
        self.enqueue(Operation::delete(key))
    }

    /// Current value as applied by the worker. Writes still queued are not
    /// visible.
    pub fn get(&self, key: impl AsRef<[u8]>) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.adapter.read(key.as_ref())?.into_option())
    }

    /// [`get`](Self::get), decoded as UTF-8.
    pub fn get_string(&self, key: impl AsRef<[u8]>) -> StoreResult<Option<String>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: impl AsRef<[u8]>) -> StoreResult<bool> {
        self.ensure_open()?;
        self.adapter.exists(key.as_ref())
    }

    /// Make every applied write durable. Queued writes are not waited for.
    pub fn sync(&self) -> StoreResult<()> {
        self.ensure_open()?;
        self.adapter.flush()
    }

    /// Block until every write accepted so far has been applied.
    pub fn wait_for_drain(&self) -> StoreResult<()> {
        self.ensure_open()?;
        if self.queue.wait_idle() {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    /// Accepted writes not yet taken by the worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> WorkerState {
        match self.worker.lock().as_ref() {
            Some(handle) if handle.is_running() => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Graceful shutdown: stop accepting writes, apply everything already
    /// accepted, then sync and close the engine.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub fn close(&self) -> StoreResult<()> {
        let worker = self.worker.lock().take().ok_or(StoreError::Closed)?;
        self.closed.store(true, Ordering::Release);

        self.queue.close();
        let joined = worker.join();
        let flushed = self.adapter.flush();
        let closed = self.adapter.close();

        let mut first = None;
        for (step, result) in [("join worker", joined), ("flush", flushed), ("close engine", closed)] {
            if let Err(e) = result {
                error!(step, error = %e, "store close step failed");
                first.get_or_insert(e);
            }
        }

        let totals = self.stats.snapshot();
        info!(applied = totals.applied, failed = totals.failed, "store closed");
        first.map_or(Ok(()), Err)
    }

    /// Ungraceful shutdown: drop every queued write, stop the worker after
    /// its current apply, and release the engine without a durability sync.
    ///
    /// Writes that were accepted but not applied are lost, as after a crash.
    pub fn abort(&self) -> StoreResult<()> {
        let worker = self.worker.lock().take().ok_or(StoreError::Closed)?;
        self.closed.store(true, Ordering::Release);

        let dropped = self.queue.discard();
        self.stats.record_discarded(dropped as u64);
        warn!(dropped, "store aborted, queued writes discarded");

        let joined = worker.join();
        let released = self.adapter.release();
        joined.and(released)
    }
}

impl<E: Engine> Drop for SpoolStore<E> {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            if let Err(e) = self.close() {
                error!(error = %e, "store close on drop failed");
            }
        }
    }
}

impl<E: Engine> std::fmt::Debug for SpoolStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolStore")
            .field("pending", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
