//! The storage engine: RAM hash table made durable by the WAL.
//!
//! **Read path**: straight from the RAM table
//! **Write path**: WAL append first, then RAM
//! **Open**: take the database lock, replay the WAL into RAM
//!
//! `LogEngine` does no internal locking. Reads take `&self` and mutations
//! take `&mut self`; a caller that shares the engine across threads wraps it
//! in a read/write lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::format::RecordKind;
use crate::platform::{try_lock_exclusive, unlock};
use crate::wal::{WalReader, WalSync, WalWriter};

/// Where a database lives on disk.
///
/// A database is named by `file_name` and `db_name`; several databases can
/// share one directory pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLocation {
    /// Database home: holds the lock file
    pub directory: PathBuf,
    /// Holds the WAL segments
    pub log_directory: PathBuf,
    pub file_name: String,
    pub db_name: String,
}

impl EngineLocation {
    pub fn new(
        directory: impl Into<PathBuf>,
        log_directory: impl Into<PathBuf>,
        file_name: impl Into<String>,
        db_name: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            log_directory: log_directory.into(),
            file_name: file_name.into(),
            db_name: db_name.into(),
        }
    }

    /// Data and logs in the same directory.
    pub fn in_dir(directory: impl Into<PathBuf>, file_name: impl Into<String>, db_name: impl Into<String>) -> Self {
        let directory = directory.into();
        Self::new(directory.clone(), directory, file_name, db_name)
    }

    fn qualified_name(&self) -> String {
        format!("{}.{}", self.file_name, self.db_name)
    }

    /// `<directory>/<file>.<db>.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.directory.join(format!("{}.lock", self.qualified_name()))
    }

    /// `<log_directory>/<file>.<db>/`
    pub fn wal_dir(&self) -> PathBuf {
        self.log_directory.join(self.qualified_name())
    }
}

/// Engine resources released by `close`.
struct OpenState {
    wal: WalWriter,
    lock_file: File,
}

/// RAM hash table + WAL.
pub struct LogEngine {
    /// Live key-value pairs
    data: HashMap<Vec<u8>, Vec<u8>>,
    /// None once closed
    state: Option<OpenState>,
    location: EngineLocation,
    config: EngineConfig,
}

impl LogEngine {
    /// Open or create the database at `location`.
    ///
    /// Takes the database lock, then replays the WAL into RAM. Fails with
    /// [`EngineError::Locked`] while another engine holds the database.
    pub fn open(location: EngineLocation, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        std::fs::create_dir_all(&location.directory)
            .map_err(|e| EngineError::io_at(&location.directory, e, "Failed to create database directory"))?;

        let lock_path = location.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| EngineError::io_at(&lock_path, e, "Failed to open lock file"))?;
        let acquired = try_lock_exclusive(&lock_file)
            .map_err(|e| EngineError::io_at(&lock_path, e, "Failed to lock database"))?;
        if !acquired {
            return Err(EngineError::Locked { path: lock_path });
        }

        let wal_dir = location.wal_dir();
        let mut data = HashMap::new();
        let replay = WalReader::new(&wal_dir).replay(|record| match record.kind {
            RecordKind::Put => {
                data.insert(record.key, record.value);
            }
            RecordKind::Delete => {
                data.remove(&record.key);
            }
        })?;
        let replayed = replay.records;

        let wal = WalWriter::after_replay(&wal_dir, config.wal_rotation_size_bytes, &replay)?;

        info!(
            database = %location.qualified_name(),
            wal = %wal_dir.display(),
            replayed,
            live = data.len(),
            "engine opened"
        );

        Ok(Self {
            data,
            state: Some(OpenState { wal, lock_file }),
            location,
            config,
        })
    }

    fn open_state(&self) -> EngineResult<&OpenState> {
        self.state.as_ref().ok_or(EngineError::Closed)
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(EngineError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key".to_string(),
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(EngineError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value".to_string(),
            });
        }
        Ok(())
    }

    /// Get value for key.
    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.open_state()?;
        Ok(self.data.get(key).cloned())
    }

    /// Whether key is present.
    pub fn contains_key(&self, key: &[u8]) -> EngineResult<bool> {
        self.open_state()?;
        Ok(self.data.contains_key(key))
    }

    /// Insert or replace. If the WAL append fails, RAM is never modified.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check_sizes(key, value)?;
        let durable = self.config.sync_every_write;
        let state = self.state.as_mut().ok_or(EngineError::Closed)?;
        state.wal.append(key, value, RecordKind::Put, durable)?;
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Remove a key. Returns whether it was present; an absent key writes
    /// nothing to the WAL.
    pub fn delete(&mut self, key: &[u8]) -> EngineResult<bool> {
        self.check_sizes(key, &[])?;
        let durable = self.config.sync_every_write;
        let state = self.state.as_mut().ok_or(EngineError::Closed)?;
        if !self.data.contains_key(key) {
            return Ok(false);
        }
        state.wal.append(key, &[], RecordKind::Delete, durable)?;
        self.data.remove(key);
        Ok(true)
    }

    /// Make every applied mutation durable.
    pub fn sync(&self) -> EngineResult<()> {
        self.open_state()?.wal.sync()
    }

    /// Detached handle for [`sync`](Self::sync), so a caller can run the
    /// fsync after releasing whatever lock guards the engine.
    pub fn sync_handle(&self) -> EngineResult<WalSync> {
        self.open_state()?.wal.sync_handle()
    }

    /// Sync the WAL and release the database lock.
    ///
    /// Every release step runs even when an earlier one fails; the first
    /// failure is returned. Closing twice returns [`EngineError::Closed`].
    pub fn close(&mut self) -> EngineResult<()> {
        let state = self.state.take().ok_or(EngineError::Closed)?;
        let synced = state.wal.sync();
        let result = self.release(state);
        let outcome = synced.and(result);
        match &outcome {
            Ok(()) => info!(database = %self.location.qualified_name(), "engine closed"),
            Err(e) => warn!(database = %self.location.qualified_name(), error = %e, "engine closed with errors"),
        }
        outcome
    }

    /// Release the database lock without syncing the WAL. Records already
    /// handed to the OS stay in the page cache; nothing more is forced to disk.
    pub fn close_without_sync(&mut self) -> EngineResult<()> {
        let state = self.state.take().ok_or(EngineError::Closed)?;
        debug!(database = %self.location.qualified_name(), "engine released without sync");
        self.release(state)
    }

    fn release(&self, state: OpenState) -> EngineResult<()> {
        let OpenState { wal, lock_file } = state;
        drop(wal);
        unlock(&lock_file).map_err(|e| EngineError::io_at(self.location.lock_path(), e, "Failed to unlock database"))
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn location(&self) -> &EngineLocation {
        &self.location
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current WAL segment (diagnostics). None once closed.
    pub fn wal_path(&self) -> Option<&Path> {
        self.state.as_ref().map(|s| s.wal.current_path())
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.close() {
                warn!(error = %e, "engine close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for LogEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEngine")
            .field("location", &self.location)
            .field("entries", &self.data.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
