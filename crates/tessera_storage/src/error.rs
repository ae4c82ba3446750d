//! Error types for block store operations.

use crate::backend::BlockId;
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

    /// The block id was never allocated by this store.
    #[error("block {block} out of range: store has {allocated} blocks")]
    BlockOutOfRange {
        /// The requested block.
        block: BlockId,
        /// Number of block slots ever allocated.
        allocated: u64,
    },

    /// The block was freed and has not been reallocated.
    #[error("block {0} has been freed")]
    BlockFreed(BlockId),

    /// The payload does not fit into one block.
    #[error("payload of {len} bytes exceeds block size {block_size}")]
    BlockTooLarge {
        /// Length of the rejected payload.
        len: usize,
        /// The store's fixed block size.
        block_size: usize,
    },

    /// The backing file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the backing file.
    #[error("storage locked: another process has exclusive access")]
    Locked,
}
