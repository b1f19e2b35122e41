//! Error types for engine operations
//!
//! Every failure inside the engine is an [`EngineError`]. Variants carry the
//! file and offset involved so recovery problems can be traced back to a
//! specific WAL segment.

use std::path::PathBuf;

use thiserror::Error;

/// Engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// I/O operation failed
    #[error("{}", io_message(.path, .kind, .message))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL file is corrupted and cannot be recovered
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        /// Path to the corrupted WAL file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error(
        "Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available",
        .path.display()
    )]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected entry size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Entry size exceeds maximum allowed
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Magic bytes not found at expected location
    #[error(
        "Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
        .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3]
    )]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Another engine instance already holds the database lock
    #[error("database is locked by another engine: {}", .path.display())]
    Locked {
        /// Lock file that could not be acquired
        path: PathBuf,
    },

    /// The engine has been closed
    #[error("engine is closed")]
    Closed,

    /// Configuration rejected by `EngineConfig::validate`
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

fn io_message(path: &Option<PathBuf>, kind: &std::io::ErrorKind, message: &str) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

/// Convert std::io::Error to EngineError::Io
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl EngineError {
    /// Build an `Io` error tagged with the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error, context: &str) -> Self {
        EngineError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
