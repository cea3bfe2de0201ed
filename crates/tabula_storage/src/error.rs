//! Error types for area store operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The referenced area does not exist (never created or already deleted).
    #[error("area not found: {id}")]
    AreaNotFound {
        /// The raw area id.
        id: u64,
    },

    /// A read or write fell outside the bounds of an area.
    #[error("access out of bounds in area {id}: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// The raw area id.
        id: u64,
        /// The requested offset.
        offset: usize,
        /// The requested length.
        len: usize,
        /// The size of the area.
        size: usize,
    },

    /// The store image is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store open.
    #[error("store is locked by another process")]
    Locked,
}
