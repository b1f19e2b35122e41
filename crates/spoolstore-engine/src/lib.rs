//! SpoolStore Engine: WAL-backed RAM hash table
//!
//! The storage engine underneath the SpoolStore write pipeline. RAM is the
//! read surface; an append-only, checksummed write-ahead log makes every
//! applied mutation recoverable.
//!
//! # Architecture
//!
//! - **Read path**: straight from the RAM hash table
//! - **Write path**: WAL append first, then RAM update
//! - **Open**: exclusive database lock, then WAL replay
//! - **Sync**: one fsync makes every buffered append durable
//!
//! The engine has no internal locking. It is meant to be owned by a single
//! writer and shared with readers behind a read/write lock.

pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod platform;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{EngineLocation, LogEngine};
pub use error::{EngineError, EngineResult};
pub use format::RecordKind;
pub use wal::{Replay, WalReader, WalSync, WalWriter};
