//! Write worker: the single consumer of the pending queue
//!
//! The worker loops on [`PendingQueue::next_batch`]:
//!
//! 1. Wait (up to the poll interval) for work
//! 2. Take the whole queue as one batch
//! 3. Apply each operation in order through the engine adapter
//! 4. Log and count a failed apply, then move on to the next operation
//!
//! It exits once the queue is closed and drained, or right after the
//! current apply when the queue was discarded. It is the only thread that
//! mutates the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::adapter::{Engine, EngineAdapter};
use crate::error::{StoreError, StoreResult};
use crate::queue::{NextBatch, Operation, PendingQueue};

pub const WORKER_THREAD_NAME: &str = "spoolstore-writer";

/// Pipeline counters, shared by producers and the worker.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Operations accepted into the queue
    enqueued: AtomicU64,
    /// Operations applied to the engine
    applied: AtomicU64,
    /// Operations whose apply failed and were dropped
    failed: AtomicU64,
    /// Batches drained from the queue
    batches: AtomicU64,
    /// Operations dropped unapplied by an abort
    discarded: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub applied: u64,
    pub failed: u64,
    pub batches: u64,
    pub discarded: u64,
}

/// Handle to the running worker thread.
/// Dropping it closes the queue and waits for the worker to drain it.
pub struct WorkerHandle {
    queue: Arc<PendingQueue>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wait for the worker to exit. The queue must already be closed or
    /// discarded, otherwise this blocks until someone does.
    pub fn join(mut self) -> StoreResult<()> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| StoreError::WorkerPanicked),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.queue.close();
            let _ = handle.join();
        }
    }
}

/// Start the worker thread draining `queue` into `adapter`.
pub fn spawn_worker<E: Engine>(
    adapter: Arc<EngineAdapter<E>>,
    queue: Arc<PendingQueue>,
    stats: Arc<PipelineStats>,
    poll_interval: Duration,
) -> StoreResult<WorkerHandle> {
    let worker_queue = Arc::clone(&queue);
    let thread = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || worker_loop(&adapter, &worker_queue, &stats, poll_interval))
        .map_err(StoreError::WorkerSpawn)?;

    Ok(WorkerHandle {
        queue,
        thread: Some(thread),
    })
}

/// Marks the consumer gone when the worker exits, including by panic.
struct ConsumerExit<'a>(&'a PendingQueue);

impl Drop for ConsumerExit<'_> {
    fn drop(&mut self) {
        self.0.detach_consumer();
        if thread::panicking() {
            warn!("write worker panicked; pending queue closed");
        }
    }
}

/// Clears the in-flight mark once a batch is done, including by panic.
struct InFlight<'a>(&'a PendingQueue);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_batch();
    }
}

fn worker_loop<E: Engine>(
    adapter: &EngineAdapter<E>,
    queue: &PendingQueue,
    stats: &PipelineStats,
    poll_interval: Duration,
) {
    let _exit = ConsumerExit(queue);
    info!(capacity = queue.capacity(), "write worker started");

    loop {
        match queue.next_batch(poll_interval) {
            NextBatch::Batch(batch) => {
                let _in_flight = InFlight(queue);
                apply_batch(adapter, queue, stats, batch);
            }
            NextBatch::Empty => {}
            NextBatch::Closed => break,
        }
    }

    let totals = stats.snapshot();
    info!(
        applied = totals.applied,
        failed = totals.failed,
        batches = totals.batches,
        "write worker stopped"
    );
}

/// Apply one drained batch in order. A failed apply drops that operation
/// only; an abort drops the rest of the batch.
pub(crate) fn apply_batch<E: Engine>(
    adapter: &EngineAdapter<E>,
    queue: &PendingQueue,
    stats: &PipelineStats,
    batch: Vec<Operation>,
) {
    let size = batch.len();
    stats.batches.fetch_add(1, Ordering::Relaxed);
    debug!(size, "applying batch");

    for (index, op) in batch.into_iter().enumerate() {
        if queue.is_aborted() {
            let dropped = size - index;
            stats.record_discarded(dropped as u64);
            warn!(dropped, "store aborted, dropping rest of batch");
            return;
        }

        match adapter.apply(&op) {
            Ok(()) => {
                stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    op = op.kind(),
                    key_len = op.key().len(),
                    error = %e,
                    "apply failed, operation dropped"
                );
            }
        }
    }
}
