//! Engine configuration
//!
//! Presets for the two durability modes plus validation of every limit.

use crate::error::{EngineError, EngineResult};
use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// WAL segment rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// fsync the WAL after every mutation instead of only on `sync()`
    pub sync_every_write: bool,
}

impl EngineConfig {
    /// Buffered writes: mutations reach the OS page cache immediately and
    /// become durable on the next `sync()`.
    pub fn buffered() -> Self {
        Self {
            wal_rotation_size_bytes: 100 * 1024 * 1024,
            max_key_size: 16 * 1024,
            max_value_size: 32 * 1024 * 1024,
            sync_every_write: false,
        }
    }

    /// Every mutation is fsynced before it becomes visible.
    pub fn durable() -> Self {
        Self {
            sync_every_write: true,
            ..Self::buffered()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> EngineResult<()> {
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err(EngineError::InvalidConfig(
                "wal_rotation_size_bytes must be >= 1MB".into(),
            ));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "max_key_size must be in [1, {}]",
                MAX_KEY_SIZE
            )));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(EngineError::InvalidConfig(
                "max_value_size must be in [1, 128MB]".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::buffered()
    }
}
