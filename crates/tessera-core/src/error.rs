//! Error types for record store operations
//!
//! All record store errors are represented by the StoreError enum, which carries
//! enough context (paths, offsets, keys) to diagnose a failure after the fact.

use std::path::PathBuf;

use thiserror::Error;

/// Record store error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Modify-mode put or delete targeted a key that does not exist
    #[error("Key not found: {}", display_key(.key))]
    NotFound {
        /// The missing key
        key: Vec<u8>,
    },

    /// Insert-mode put targeted a key that already exists
    #[error("Key already exists: {}", display_key(.key))]
    AlreadyExists {
        /// The duplicate key
        key: Vec<u8>,
    },

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A chain, transaction or append lock was not acquired before the deadline
    #[error("Timed out after {timeout_ms}ms waiting for {lock}")]
    LockTimeout {
        /// Which lock was being acquired
        lock: String,
        /// The timeout that expired
        timeout_ms: u64,
    },

    /// Operation is not valid in the handle's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Commit could not be made durable; none of the transaction's writes applied
    #[error("Commit failed: {reason}")]
    CommitFailed {
        /// What went wrong while writing the batch
        reason: String,
    },

    /// Store file is corrupted and cannot be recovered
    #[error("Store file corrupted in {} at offset {offset}: {reason}", .path.display())]
    LogCorrupted {
        /// Path to the corrupted file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
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

    /// Torn write detected (partial entry at end of file)
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
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

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {}", .path.display(), hex(.found_bytes))]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
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
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => format!("{:?}", s),
        Err(_) => hex(key),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for record store operations
pub type StoreResult<T> = Result<T, StoreError>;
