//! Integration tests: the write pipeline over the WAL-backed engine.
//!
//! These tests go through the public `SpoolStore` API only and reopen the
//! database from disk wherever durability is the point.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tempfile::TempDir;

use spoolstore::{
    Engine, EngineConfig, EngineError, EngineLocation, EngineOp, LogEngine, SpoolStore, StoreConfig, StoreError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const FILE: &str = "test.hash";
const DB: &str = "test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> StoreConfig {
    StoreConfig::default().with_poll_interval(Duration::from_millis(20))
}

fn open_store(dir: &TempDir) -> SpoolStore {
    init_tracing();
    SpoolStore::open_with_config(dir.path(), dir.path(), FILE, DB, fast_config()).unwrap()
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Blocks every caller of `wait` until `open` is called.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

const GATE_KEY: &[u8] = b"gate";

/// LogEngine with fault injection: mutations of `poisoned` keys fail, and a
/// put of `GATE_KEY` blocks until the gate opens.
struct TestEngine {
    inner: LogEngine,
    poisoned: HashSet<Vec<u8>>,
    gate: Arc<Gate>,
}

impl TestEngine {
    fn open(dir: &Path, poisoned: &[&str], gate: Arc<Gate>) -> Self {
        let location = EngineLocation::in_dir(dir, FILE, DB);
        Self {
            inner: LogEngine::open(location, EngineConfig::default()).unwrap(),
            poisoned: poisoned.iter().map(|k| k.as_bytes().to_vec()).collect(),
            gate,
        }
    }

    fn check(&self, key: &[u8]) -> Result<(), EngineError> {
        if self.poisoned.contains(key) {
            return Err(EngineError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: "injected write failure".to_string(),
            });
        }
        if key == GATE_KEY {
            self.gate.wait();
        }
        Ok(())
    }
}

impl Engine for TestEngine {
    type Error = EngineError;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.check(key)?;
        self.inner.put(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.inner.get(key)
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        self.check(key)?;
        self.inner.delete(key)
    }

    fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        self.inner.contains_key(key)
    }

    fn sync(&self) -> Result<(), EngineError> {
        self.inner.sync()
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.inner.close()
    }

    fn close_without_sync(&mut self) -> Result<(), EngineError> {
        self.inner.close_without_sync()
    }
}

/// Store over a `TestEngine` whose worker is parked on the gate: the gate
/// put has been taken off the queue and is blocked inside the engine.
fn parked_store(dir: &TempDir, capacity: usize, poisoned: &[&str]) -> (SpoolStore<TestEngine>, Arc<Gate>) {
    init_tracing();
    let gate = Arc::new(Gate::default());
    let engine = TestEngine::open(dir.path(), poisoned, Arc::clone(&gate));
    let store = SpoolStore::with_engine(engine, fast_config().with_queue_capacity(capacity)).unwrap();

    store.put(GATE_KEY, b"open").unwrap();
    wait_until("worker to take the gate put", || store.pending() == 0);
    (store, gate)
}

// ---------------------------------------------------------------------------
// Pipeline properties
// ---------------------------------------------------------------------------

#[test]
fn test_durable_after_drain_and_sync() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        for i in 0..1000 {
            store.put(format!("k{}", i), format!("v{}", i)).unwrap();
        }
        store.wait_for_drain().unwrap();
        store.sync().unwrap();

        for i in 0..1000 {
            assert_eq!(store.get_string(format!("k{}", i)).unwrap(), Some(format!("v{}", i)));
        }
        store.close().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.get_string("k0").unwrap().as_deref(), Some("v0"));
    assert_eq!(store.get_string("k999").unwrap().as_deref(), Some("v999"));
}

#[test]
fn test_fruit_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put("apple", "fruit: apple").unwrap();
    store.put("banana", "fruit: banana").unwrap();
    store.delete("banana").unwrap();
    store.wait_for_drain().unwrap();
    store.sync().unwrap();

    assert_eq!(store.get("apple").unwrap(), Some(b"fruit: apple".to_vec()));
    assert_eq!(store.get("banana").unwrap(), None);
    assert!(!store.exists("banana").unwrap());
}

#[test]
fn test_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put("carrot", "vegetable: carrot").unwrap();
    store.delete("never-written").unwrap();
    store.wait_for_drain().unwrap();
    assert_eq!(store.get_string("carrot").unwrap().as_deref(), Some("vegetable: carrot"));
    assert_eq!(store.get("never-written").unwrap(), None);

    store.delete("carrot").unwrap();
    store.delete("carrot").unwrap();
    store.wait_for_drain().unwrap();
    assert_eq!(store.get("carrot").unwrap(), None);
    assert_eq!(store.stats().failed, 0);
}

#[test]
fn test_same_thread_writes_apply_in_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put("k", "a").unwrap();
    store.put("k", "b").unwrap();
    store.wait_for_drain().unwrap();
    assert_eq!(store.get_string("k").unwrap().as_deref(), Some("b"));

    store.put("k", "c").unwrap();
    store.delete("k").unwrap();
    store.put("k", "d").unwrap();
    store.wait_for_drain().unwrap();
    assert_eq!(store.get_string("k").unwrap().as_deref(), Some("d"));
}

#[test]
fn test_queued_writes_are_not_yet_visible() {
    let dir = TempDir::new().unwrap();
    let (store, gate) = parked_store(&dir, 16, &[]);

    // The parked worker holds the engine write lock, so reads would wait on it
    store.put("potato", "vegetable: potato").unwrap();
    assert_eq!(store.pending(), 1);
    assert_eq!(store.stats().applied, 0);

    gate.open();
    store.wait_for_drain().unwrap();
    assert_eq!(store.stats().applied, 2);
    assert_eq!(store.get_string("potato").unwrap().as_deref(), Some("vegetable: potato"));
}

#[test]
fn test_full_queue_blocks_producer_until_space_frees() {
    let dir = TempDir::new().unwrap();
    let (store, gate) = parked_store(&dir, 2, &[]);

    store.put("a", "1").unwrap();
    store.put("b", "2").unwrap();
    assert_eq!(store.pending(), 2);

    let returned = AtomicBool::new(false);
    thread::scope(|s| {
        let producer = s.spawn(|| {
            let result = store.put("c", "3");
            returned.store(true, Ordering::SeqCst);
            result
        });

        thread::sleep(Duration::from_millis(150));
        assert!(!returned.load(Ordering::SeqCst), "put must block while the queue is full");
        assert_eq!(store.pending(), 2);

        gate.open();
        producer.join().unwrap().unwrap();
    });

    store.wait_for_drain().unwrap();
    for key in ["a", "b", "c"] {
        assert!(store.exists(key).unwrap(), "{} was dropped", key);
    }
    let totals = store.stats();
    assert_eq!(totals.enqueued, 4);
    assert_eq!(totals.applied, 4);
    assert_eq!(totals.failed, 0);
}

#[test]
fn test_abort_loses_queued_writes() {
    let dir = TempDir::new().unwrap();
    {
        let (store, gate) = parked_store(&dir, 16, &[]);
        for key in ["queued1", "queued2", "queued3"] {
            store.put(key, "lost").unwrap();
        }
        assert_eq!(store.pending(), 3);

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                gate.open();
            });
            store.abort().unwrap();
        });

        assert!(matches!(store.put("late", "x"), Err(StoreError::Closed)));
        assert_eq!(store.stats().discarded, 3);
    }

    let store = open_store(&dir);
    for key in ["queued1", "queued2", "queued3"] {
        assert_eq!(store.get(key).unwrap(), None, "{} survived an abort", key);
    }
}

#[test]
fn test_applied_writes_survive_abort() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.put("pineapple", "fruit: pineapple").unwrap();
        store.wait_for_drain().unwrap();
        store.abort().unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.get_string("pineapple").unwrap().as_deref(), Some("fruit: pineapple"));
}

#[test]
fn test_failed_apply_dropped_rest_of_batch_applied() {
    let dir = TempDir::new().unwrap();
    let (store, gate) = parked_store(&dir, 16, &["k3"]);

    // Queued behind the parked gate put, so the worker drains all five at once
    for i in 1..=5 {
        store.put(format!("k{}", i), "v").expect("enqueue never reports apply failures");
    }
    assert_eq!(store.pending(), 5);

    gate.open();
    store.wait_for_drain().unwrap();

    for key in ["k1", "k2", "k4", "k5"] {
        assert!(store.exists(key).unwrap(), "{} missing", key);
    }
    assert!(!store.exists("k3").unwrap());

    let totals = store.stats();
    assert_eq!(totals.failed, 1);
    assert_eq!(totals.applied, 5);
    assert_eq!(totals.batches, 2);
}

#[test]
fn test_concurrent_producers() {
    let dir = TempDir::new().unwrap();
    let store = SpoolStore::open_with_config(
        dir.path(),
        dir.path(),
        FILE,
        DB,
        fast_config().with_queue_capacity(64),
    )
    .unwrap();

    const THREADS: usize = 8;
    const WRITES: usize = 500;

    thread::scope(|s| {
        for t in 0..THREADS {
            let store = &store;
            s.spawn(move || {
                for i in 0..WRITES {
                    store.put(format!("t{}-{}", t, i), i.to_string()).unwrap();
                    // Same key rewritten in order: the last value must win
                    store.put(format!("t{}", t), i.to_string()).unwrap();
                }
            });
        }
    });
    store.wait_for_drain().unwrap();

    for t in 0..THREADS {
        assert_eq!(store.get_string(format!("t{}", t)).unwrap(), Some((WRITES - 1).to_string()));
        assert!(store.exists(format!("t{}-{}", t, WRITES - 1)).unwrap());
    }
    let totals = store.stats();
    assert_eq!(totals.applied, (THREADS * WRITES * 2) as u64);
    assert!(totals.batches >= 1);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_second_open_fails_while_first_is_open() {
    if !cfg!(any(unix, windows)) {
        return;
    }
    let dir = TempDir::new().unwrap();
    let first = open_store(&dir);

    let err = SpoolStore::open_in(dir.path(), FILE, DB).err().expect("database must be locked");
    assert_eq!(err.engine_op(), Some(EngineOp::Open));

    first.close().unwrap();
    SpoolStore::open_in(dir.path(), FILE, DB).unwrap();
}

#[test]
fn test_separate_log_directory() {
    let data = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    {
        let store = SpoolStore::open(data.path(), logs.path(), FILE, DB).unwrap();
        store.put("k", "v").unwrap();
        store.close().unwrap();
    }

    assert!(data.path().join(format!("{}.{}.lock", FILE, DB)).exists());
    assert!(logs.path().join(format!("{}.{}", FILE, DB)).is_dir());

    let store = SpoolStore::open(data.path(), logs.path(), FILE, DB).unwrap();
    assert_eq!(store.get_string("k").unwrap().as_deref(), Some("v"));
}

#[test]
fn test_close_drains_pending_writes() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        for i in 0..2000 {
            store.put(format!("k{}", i), "v").unwrap();
        }
        // No wait_for_drain: close itself must apply what was accepted
        store.close().unwrap();
        assert_eq!(store.stats().applied, 2000);
    }

    let store = open_store(&dir);
    assert!(store.exists("k1999").unwrap());
}

#[test]
fn test_close_releases_blocked_producer() {
    let dir = TempDir::new().unwrap();
    {
        let (store, gate) = parked_store(&dir, 1, &[]);
        store.put("fills", "queue").unwrap();

        thread::scope(|s| {
            let producer = s.spawn(|| store.put("blocked", "x"));
            thread::sleep(Duration::from_millis(50));

            let closer = s.spawn(|| store.close());
            thread::sleep(Duration::from_millis(50));
            gate.open();

            let result = producer.join().unwrap();
            assert!(matches!(result, Err(StoreError::QueueClosed) | Err(StoreError::Closed)));
            closer.join().unwrap().unwrap();
        });
    }

    let store = open_store(&dir);
    assert!(store.exists("fills").unwrap());
    assert!(!store.exists("blocked").unwrap());
}
