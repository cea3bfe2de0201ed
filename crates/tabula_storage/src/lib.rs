//! # Tabula Storage
//!
//! Area store trait and implementations for Tabula.
//!
//! This crate provides the lowest-level storage abstraction used by the
//! table engine. An area store hands out variably-sized **areas**, each
//! addressed by an opaque 64-bit [`AreaId`]. Stores do not interpret the
//! bytes they hold.
//!
//! ## Design Principles
//!
//! - Areas are created with a fixed size and written in place
//! - The store keeps exactly one well-known pointer, the root area
//! - Structural writes happen inside [`AreaStore::lock_for_write`]
//! - Must be `Send + Sync` for concurrent access
//! - The table engine owns all format interpretation
//!
//! ## Available Stores
//!
//! - [`HeapAreaStore`] - For testing and ephemeral databases
//! - [`FileAreaStore`] - Persists a checksummed image on checkpoint
//!
//! ## Example
//!
//! ```rust
//! use tabula_storage::{AreaStore, HeapAreaStore};
//!
//! let store = HeapAreaStore::new();
//! let id = store.create_area(11).unwrap();
//! store.write_at(id, 0, b"hello world").unwrap();
//! assert_eq!(store.read_at(id, 6, 5).unwrap(), b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod area;
mod error;
mod file;
mod heap;

pub use area::{AreaId, AreaStore, MutableArea, WriteLock};
pub use error::{StorageError, StorageResult};
pub use file::FileAreaStore;
pub use heap::HeapAreaStore;
