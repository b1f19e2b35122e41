//! SpoolStore: key-value store with an asynchronous write pipeline
//!
//! Writers never wait on the engine's commit path. Every `put` and `delete`
//! goes into one bounded queue; a single background worker drains it and
//! applies each operation to the engine in submission order.
//!
//! # Architecture
//!
//! - **Write path**: enqueue, return; blocks only while the queue is full
//! - **Worker**: drains the whole queue per wake, applies ops one by one,
//!   logs and drops a failed apply
//! - **Read path**: `get`/`exists` read the engine directly and see only
//!   writes the worker has already applied
//! - **Durability**: `sync` fsyncs applied state; the queue itself is memory
//!   only and is lost on a crash or [`SpoolStore::abort`]
//!
//! ```no_run
//! use spoolstore::SpoolStore;
//!
//! # fn main() -> Result<(), spoolstore::StoreError> {
//! let store = SpoolStore::open_in("/var/lib/fruit", "test.hash", "test")?;
//! store.put("apple", "fruit: apple")?;
//! store.put("banana", "fruit: banana")?;
//! store.delete("banana")?;
//!
//! store.wait_for_drain()?;
//! store.sync()?;
//! assert_eq!(store.get_string("apple")?.as_deref(), Some("fruit: apple"));
//! assert_eq!(store.get("banana")?, None);
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The default engine is [`spoolstore_engine::LogEngine`]. Any type
//! implementing [`Engine`] can be plugged in with [`SpoolStore::with_engine`].

pub mod adapter;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod worker;

pub use adapter::{Engine, EngineAdapter, Lookup};
pub use config::{StoreConfig, DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_CAPACITY};
pub use error::{EngineOp, StoreError, StoreResult};
pub use queue::{NextBatch, Operation, PendingQueue};
pub use store::{SpoolStore, WorkerState};
pub use worker::{PipelineStats, StatsSnapshot};

pub use spoolstore_engine::{EngineConfig, EngineError, EngineLocation, LogEngine};
