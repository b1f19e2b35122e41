//! Engine contract and the adapter that normalizes it
//!
//! [`Engine`] is the narrow contract the store needs from a storage engine.
//! [`EngineAdapter`] owns one engine behind a read/write lock and turns every
//! outcome into Success / NotFound / [`StoreError::Engine`]:
//!
//! - `read`, `exists` share the lock
//! - `apply_put`, `apply_delete`, `close` take it exclusively
//! - `flush` shares it only long enough to get a [`WalSync`] handle, then
//!   syncs unlocked so the worker is not stalled behind the fsync
//!
//! Deleting an absent key is a success. Nothing here retries.

use parking_lot::RwLock;
use spoolstore_engine::{EngineConfig, EngineError, EngineLocation, LogEngine, WalSync};

use crate::error::{EngineOp, StoreError, StoreResult};
use crate::queue::Operation;

/// What the store needs from a storage engine.
///
/// Mutations take `&mut self`; the adapter's lock guarantees they never run
/// concurrently with each other or with reads.
pub trait Engine: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert or replace.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Self::Error>;

    /// Value for `key`, `None` when absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Remove `key`; returns whether it was present.
    fn delete(&mut self, key: &[u8]) -> Result<bool, Self::Error>;

    fn exists(&self, key: &[u8]) -> Result<bool, Self::Error>;

    /// Make everything applied so far durable.
    fn sync(&self) -> Result<(), Self::Error>;

    /// Handle that performs [`sync`](Self::sync) without borrowing the
    /// engine. `None` means sync under the lock.
    fn sync_handle(&self) -> Result<Option<WalSync>, Self::Error> {
        Ok(None)
    }

    /// Release the engine. Must report a failure to release cleanly.
    fn close(&mut self) -> Result<(), Self::Error>;

    /// Release the engine without forcing a durability sync. Engines that
    /// cannot skip the sync fall back to `close`.
    fn close_without_sync(&mut self) -> Result<(), Self::Error> {
        self.close()
    }
}

impl Engine for LogEngine {
    type Error = EngineError;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        LogEngine::put(self, key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        LogEngine::get(self, key)
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        LogEngine::delete(self, key)
    }

    fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        self.contains_key(key)
    }

    fn sync(&self) -> Result<(), EngineError> {
        LogEngine::sync(self)
    }

    fn sync_handle(&self) -> Result<Option<WalSync>, EngineError> {
        LogEngine::sync_handle(self).map(Some)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        LogEngine::close(self)
    }

    fn close_without_sync(&mut self) -> Result<(), EngineError> {
        LogEngine::close_without_sync(self)
    }
}

/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    NotFound,
}

impl Lookup {
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl From<Option<Vec<u8>>> for Lookup {
    fn from(value: Option<Vec<u8>>) -> Self {
        value.map_or(Lookup::NotFound, Lookup::Found)
    }
}

pub struct EngineAdapter<E> {
    engine: RwLock<E>,
}

impl EngineAdapter<LogEngine> {
    /// Open a [`LogEngine`] at `location`.
    pub fn open(location: EngineLocation, config: EngineConfig) -> StoreResult<Self> {
        let engine = LogEngine::open(location, config).map_err(|e| StoreError::engine(EngineOp::Open, e))?;
        Ok(Self::new(engine))
    }
}

impl<E: Engine> EngineAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine: RwLock::new(engine) }
    }

    pub fn apply_put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.engine
            .write()
            .put(key, value)
            .map_err(|e| StoreError::engine(EngineOp::Put, e))
    }

    /// Absent keys are a success.
    pub fn apply_delete(&self, key: &[u8]) -> StoreResult<()> {
        self.engine
            .write()
            .delete(key)
            .map(|_removed| ())
            .map_err(|e| StoreError::engine(EngineOp::Delete, e))
    }

    pub fn apply(&self, op: &Operation) -> StoreResult<()> {
        match op {
            Operation::Put { key, value } => self.apply_put(key, value),
            Operation::Delete { key } => self.apply_delete(key),
        }
    }

    pub fn read(&self, key: &[u8]) -> StoreResult<Lookup> {
        self.engine
            .read()
            .get(key)
            .map(Lookup::from)
            .map_err(|e| StoreError::engine(EngineOp::Read, e))
    }

    pub fn exists(&self, key: &[u8]) -> StoreResult<bool> {
        self.engine
            .read()
            .exists(key)
            .map_err(|e| StoreError::engine(EngineOp::Exists, e))
    }

    /// Durability sync of what the engine already has. Does not touch the
    /// pending queue.
    pub fn flush(&self) -> StoreResult<()> {
        let handle = {
            let engine = self.engine.read();
            match engine.sync_handle() {
                Ok(Some(handle)) => handle,
                Ok(None) => return engine.sync().map_err(|e| StoreError::engine(EngineOp::Flush, e)),
                Err(e) => return Err(StoreError::engine(EngineOp::Flush, e)),
            }
        };
        handle.sync().map_err(|e| StoreError::engine(EngineOp::Flush, e))
    }

    pub fn close(&self) -> StoreResult<()> {
        self.engine
            .write()
            .close()
            .map_err(|e| StoreError::engine(EngineOp::Close, e))
    }

    /// Close without a durability sync.
    pub fn release(&self) -> StoreResult<()> {
        self.engine
            .write()
            .close_without_sync()
            .map_err(|e| StoreError::engine(EngineOp::Close, e))
    }
}
