//! Error types for store operations
//!
//! Only synchronous calls return these. A Put or Delete that fails after it
//! was accepted into the pending queue is logged and counted by the worker,
//! never reported back to the caller that enqueued it.

use std::fmt;

use thiserror::Error;

/// Engine call that produced an [`StoreError::Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Open,
    Put,
    Delete,
    Read,
    Exists,
    Flush,
    Close,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOp::Open => "open",
            EngineOp::Put => "put",
            EngineOp::Delete => "delete",
            EngineOp::Read => "read",
            EngineOp::Exists => "exists",
            EngineOp::Flush => "flush",
            EngineOp::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The pending queue stopped accepting operations because the store is
    /// shutting down
    #[error("pending queue is closed")]
    QueueClosed,

    /// A synchronous engine call failed
    #[error("engine {op} failed: {source}")]
    Engine {
        op: EngineOp,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The store was closed or aborted
    #[error("store is closed")]
    Closed,

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("stored value is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("failed to spawn write worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("write worker panicked")]
    WorkerPanicked,
}

impl StoreError {
    pub(crate) fn engine<E>(op: EngineOp, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Engine { op, source: Box::new(err) }
    }

    /// The engine call that failed, for `Engine` errors.
    pub fn engine_op(&self) -> Option<EngineOp> {
        match self {
            StoreError::Engine { op, .. } => Some(*op),
            _ => None,
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
