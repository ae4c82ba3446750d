//! Block store trait definition.

use crate::error::StorageResult;
use std::fmt;

/// Identifier of one fixed-size block inside a [`BlockStore`].
///
/// Ids are dense slot numbers. A freed id may be handed out again by a
/// later `allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Creates a block id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk:{}", self.0)
    }
}

/// A low-level block store for Tessera.
///
/// Block stores are **opaque**: they hand out fixed-size blocks and move
/// bytes in and out of them. Tessera owns every interpretation of block
/// contents - stores know nothing about rows or indexes.
///
/// # Invariants
///
/// - `allocate` returns a block that is not live
/// - `read_block` returns exactly `block_size()` bytes: the last payload
///   written to the block, zero padded
/// - `flush` and `sync` make every completed `write_block` durable
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBlockStore`] - For testing
/// - [`super::FileBlockStore`] - For persistent storage
pub trait BlockStore: Send + Sync {
    /// Returns the fixed size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Allocates a zeroed block and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot grow.
    fn allocate(&mut self) -> StorageResult<BlockId>;

    /// Reads the full contents of a block.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The block was never allocated
    /// - The block has been freed
    /// - An I/O error occurs
    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>>;

    /// Overwrites a block with `data`, zero padding the remainder.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is longer than the block size, the block
    /// is not live, or an I/O error occurs.
    fn write_block(&mut self, id: BlockId, data: &[u8]) -> StorageResult<()>;

    /// Returns a block to the store for reuse.
    ///
    /// # Errors
    ///
    /// Returns an error if the block is not live.
    fn free(&mut self, id: BlockId) -> StorageResult<()>;

    /// Flushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the number of allocated, not yet freed blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the count cannot be determined.
    fn live_blocks(&self) -> StorageResult<u64>;
}
