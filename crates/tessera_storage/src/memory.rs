//! In-memory block store for testing.

use crate::backend::{BlockId, BlockStore};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// Default block size used by [`InMemoryBlockStore::new`].
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

#[derive(Debug, Default)]
struct Slots {
    /// `None` marks a freed slot.
    blocks: Vec<Option<Vec<u8>>>,
    free_list: Vec<u64>,
}

/// An in-memory block store.
///
/// This store keeps every block in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// # Example
///
/// ```rust
/// use tessera_storage::{BlockStore, InMemoryBlockStore};
///
/// let mut store = InMemoryBlockStore::with_block_size(64);
/// let id = store.allocate().unwrap();
/// store.write_block(id, b"hello").unwrap();
/// assert_eq!(&store.read_block(id).unwrap()[..5], b"hello");
/// ```
#[derive(Debug)]
pub struct InMemoryBlockStore {
    block_size: usize,
    slots: RwLock<Slots>,
}

impl Default for InMemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBlockStore {
    /// Creates an empty store with [`DEFAULT_BLOCK_SIZE`] blocks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Creates an empty store with the given block size.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Returns the number of slots ever allocated, live or freed.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.slots.read().blocks.len() as u64
    }

    fn check_live(slots: &Slots, id: BlockId) -> StorageResult<usize> {
        let index = id.as_u64() as usize;
        match slots.blocks.get(index) {
            Some(Some(_)) => Ok(index),
            Some(None) => Err(StorageError::BlockFreed(id)),
            None => Err(StorageError::BlockOutOfRange {
                block: id,
                allocated: slots.blocks.len() as u64,
            }),
        }
    }
}

impl BlockStore for InMemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&mut self) -> StorageResult<BlockId> {
        let mut slots = self.slots.write();
        let zeroed = vec![0u8; self.block_size];
        if let Some(reused) = slots.free_list.pop() {
            slots.blocks[reused as usize] = Some(zeroed);
            return Ok(BlockId::new(reused));
        }
        slots.blocks.push(Some(zeroed));
        Ok(BlockId::new(slots.blocks.len() as u64 - 1))
    }

    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>> {
        let slots = self.slots.read();
        let index = Self::check_live(&slots, id)?;
        Ok(slots.blocks[index].clone().unwrap_or_default())
    }

    fn write_block(&mut self, id: BlockId, data: &[u8]) -> StorageResult<()> {
        if data.len() > self.block_size {
            return Err(StorageError::BlockTooLarge {
                len: data.len(),
                block_size: self.block_size,
            });
        }
        let mut slots = self.slots.write();
        let index = Self::check_live(&slots, id)?;
        let mut block = vec![0u8; self.block_size];
        block[..data.len()].copy_from_slice(data);
        slots.blocks[index] = Some(block);
        Ok(())
    }

    fn free(&mut self, id: BlockId) -> StorageResult<()> {
        let mut slots = self.slots.write();
        let index = Self::check_live(&slots, id)?;
        slots.blocks[index] = None;
        slots.free_list.push(id.as_u64());
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn live_blocks(&self) -> StorageResult<u64> {
        let slots = self.slots.read();
        Ok((slots.blocks.len() - slots.free_list.len()) as u64)
    }
}
