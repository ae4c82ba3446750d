//! File-based block store for persistent storage.

use crate::backend::{BlockId, BlockStore};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A block store backed by a single file of fixed-size slots.
///
/// Block `n` lives at byte offset `n * block_size`. The file is locked
/// exclusively (advisory lock) for as long as the store is open, so two
/// processes cannot hand out the same blocks.
///
/// Freed slots are tracked in memory only. After a reopen every slot in
/// the file is considered live; deciding which blocks are still referenced
/// belongs to whoever owns the catalog.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Example
///
/// ```no_run
/// use tessera_storage::{BlockStore, FileBlockStore};
/// use std::path::Path;
///
/// let mut store = FileBlockStore::open(Path::new("tables.blk"), 4096).unwrap();
/// let id = store.allocate().unwrap();
/// store.write_block(id, b"persistent data").unwrap();
/// store.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBlockStore {
    path: PathBuf,
    block_size: usize,
    file: Mutex<File>,
    /// Number of slots in the file.
    slots: RwLock<u64>,
    free_list: RwLock<BTreeSet<u64>>,
}

impl FileBlockStore {
    /// Opens or creates a block file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - Another process holds the file (`Locked`)
    /// - The file length is not a multiple of `block_size` (`Corrupted`)
    pub fn open(path: &Path, block_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive().map_err(|_| StorageError::Locked)?;

        let len = file.metadata()?.len();
        if block_size == 0 || len % block_size as u64 != 0 {
            return Err(StorageError::Corrupted(format!(
                "file length {len} is not a multiple of block size {block_size}"
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            file: Mutex::new(file),
            slots: RwLock::new(len / block_size as u64),
            free_list: RwLock::new(BTreeSet::new()),
        })
    }

    /// Opens or creates a block file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path, block_size: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path, block_size)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_live(&self, id: BlockId) -> StorageResult<u64> {
        let slots = *self.slots.read();
        if id.as_u64() >= slots {
            return Err(StorageError::BlockOutOfRange {
                block: id,
                allocated: slots,
            });
        }
        if self.free_list.read().contains(&id.as_u64()) {
            return Err(StorageError::BlockFreed(id));
        }
        Ok(id.as_u64() * self.block_size as u64)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut block = vec![0u8; self.block_size];
        block[..data.len()].copy_from_slice(data);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&block)?;
        Ok(())
    }
}

impl BlockStore for FileBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&mut self) -> StorageResult<BlockId> {
        let reused = {
            let mut free = self.free_list.write();
            let first = free.iter().next().copied();
            if let Some(slot) = first {
                free.remove(&slot);
            }
            first
        };

        let slot = match reused {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write();
                *slots += 1;
                *slots - 1
            }
        };

        if let Err(err) = self.write_at(slot * self.block_size as u64, &[]) {
            // Hand the slot back so a failed allocation leaks nothing
            self.free_list.write().insert(slot);
            return Err(err);
        }
        Ok(BlockId::new(slot))
    }

    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>> {
        let offset = self.check_live(id)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; self.block_size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_block(&mut self, id: BlockId, data: &[u8]) -> StorageResult<()> {
        if data.len() > self.block_size {
            return Err(StorageError::BlockTooLarge {
                len: data.len(),
                block_size: self.block_size,
            });
        }
        let offset = self.check_live(id)?;
        self.write_at(offset, data)
    }

    fn free(&mut self, id: BlockId) -> StorageResult<()> {
        self.check_live(id)?;
        self.free_list.write().insert(id.as_u64());
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn live_blocks(&self) -> StorageResult<u64> {
        Ok(*self.slots.read() - self.free_list.read().len() as u64)
    }
}
