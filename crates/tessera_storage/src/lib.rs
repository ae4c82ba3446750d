//! # Tessera Storage
//!
//! Block store trait and implementations for Tessera.
//!
//! This crate provides the lowest-level storage abstraction for Tessera.
//! Block stores are **opaque** - they allocate, read, write and free
//! fixed-size blocks without interpreting what is inside them.
//!
//! ## Design Principles
//!
//! - Stores are simple block arrays (allocate, read, write, free, flush)
//! - No knowledge of rows, index blocks or transactions
//! - Must be `Send + Sync` for concurrent access
//! - Tessera owns all interpretation of block contents
//!
//! ## Available Stores
//!
//! - [`InMemoryBlockStore`] - For testing and ephemeral databases
//! - [`FileBlockStore`] - For persistent storage in a single file
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{BlockStore, InMemoryBlockStore};
//!
//! let mut store = InMemoryBlockStore::new();
//! let block = store.allocate().unwrap();
//! store.write_block(block, b"hello world").unwrap();
//! let data = store.read_block(block).unwrap();
//! assert_eq!(&data[..11], b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{BlockId, BlockStore};
pub use error::{StorageError, StorageResult};
pub use file::FileBlockStore;
pub use memory::{InMemoryBlockStore, DEFAULT_BLOCK_SIZE};
