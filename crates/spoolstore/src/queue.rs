//! Bounded pending queue between producers and the write worker
//!
//! Producers block in [`PendingQueue::push`] while the queue is full. The
//! single consumer takes the whole current contents at once with
//! [`PendingQueue::next_batch`], blocking while the queue is empty. Every
//! wait is on a condition variable, so a push into an empty queue wakes the
//! worker immediately and a drain wakes every blocked producer.
//!
//! FIFO holds across threads: operations leave in the order the mutex
//! serialized their pushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{StoreError, StoreResult};

/// A mutation accepted for asynchronous application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert or replace
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove; a no-op when the key is absent
    Delete { key: Vec<u8> },
}

impl Operation {
    pub fn put(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Operation::Put {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        }
    }

    pub fn delete(key: impl AsRef<[u8]>) -> Self {
        Operation::Delete { key: key.as_ref().to_vec() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => key,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Put { .. } => "put",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// Result of one consumer wait.
#[derive(Debug, PartialEq, Eq)]
pub enum NextBatch {
    /// Everything that was queued, in FIFO order
    Batch(Vec<Operation>),
    /// The wait timed out with nothing queued
    Empty,
    /// Closed and fully drained; the consumer should exit
    Closed,
}

struct QueueState {
    ops: VecDeque<Operation>,
    /// No further pushes are accepted
    closed: bool,
    /// The consumer holds a batch it has not finished applying
    in_flight: bool,
    /// The consumer has exited
    consumer_gone: bool,
}

pub struct PendingQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when space frees up or the queue closes
    not_full: Condvar,
    /// Signalled on the empty to non-empty transition or close
    not_empty: Condvar,
    /// Signalled when the queue is empty and no batch is in flight
    idle: Condvar,
    /// Set by `discard`; the consumer stops mid-batch
    aborted: AtomicBool,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ops: VecDeque::new(),
                closed: false,
                in_flight: false,
                consumer_gone: false,
            }),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            idle: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Append `op`, blocking while the queue is at capacity.
    ///
    /// Fails only once the queue is closed, including when it closes while
    /// this call is blocked.
    pub fn push(&self, op: Operation) -> StoreResult<()> {
        let mut state = self.state.lock();
        while state.ops.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(StoreError::QueueClosed);
        }

        let was_empty = state.ops.is_empty();
        state.ops.push_back(op);
        if was_empty {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Take the entire current contents, waiting up to `wait` for the first
    /// operation. Marks the batch in flight until [`finish_batch`](Self::finish_batch).
    pub fn next_batch(&self, wait: Duration) -> NextBatch {
        let mut state = self.state.lock();
        if state.ops.is_empty() && !state.closed {
            let _ = self.not_empty.wait_for(&mut state, wait);
        }

        if !state.ops.is_empty() {
            let batch = Vec::from(std::mem::take(&mut state.ops));
            state.in_flight = true;
            self.not_full.notify_all();
            return NextBatch::Batch(batch);
        }

        if state.closed {
            NextBatch::Closed
        } else {
            NextBatch::Empty
        }
    }

    /// The consumer is done with the batch from the last `next_batch`.
    pub fn finish_batch(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        if state.ops.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Block until everything pushed so far has been applied.
    ///
    /// Returns false if the consumer exited with operations still queued.
    pub fn wait_idle(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.ops.is_empty() && !state.in_flight {
                return true;
            }
            if state.consumer_gone {
                return false;
            }
            self.idle.wait(&mut state);
        }
    }

    /// Stop accepting pushes. Queued operations are still handed out.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Close and drop every queued operation. The consumer stops before its
    /// next apply. Returns how many operations were dropped from the queue.
    pub fn discard(&self) -> usize {
        self.aborted.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.closed = true;
        let dropped = state.ops.len();
        state.ops.clear();
        self.not_full.notify_all();
        self.not_empty.notify_all();
        if !state.in_flight {
            self.idle.notify_all();
        }
        dropped
    }

    /// Called once by the consumer on exit, also while unwinding from a
    /// panic. Closes the queue so producers fail instead of blocking forever.
    pub fn detach_consumer(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.consumer_gone = true;
        state.in_flight = false;
        self.not_full.notify_all();
        self.idle.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PendingQueue")
            .field("len", &state.ops.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
