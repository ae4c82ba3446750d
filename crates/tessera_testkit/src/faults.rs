//! Fault injection for block stores.
//!
//! [`FaultyBlockStore`] wraps an [`InMemoryBlockStore`] and starts failing
//! writes once a [`FaultSwitch`] says so. The switch stays with the test
//! after the store has been handed to a conglomerate.
//!
//! ## Usage
//!
//! ```rust
//! use tessera_testkit::faults::FaultyBlockStore;
//! use tessera_core::{Config, Conglomerate};
//!
//! let (store, switch) = FaultyBlockStore::new(1024);
//! let db = Conglomerate::new(Config::default(), Box::new(store)).unwrap();
//! switch.fail_after_writes(0);
//! // every commit that writes a block now fails
//! switch.reset();
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_storage::{BlockId, BlockStore, InMemoryBlockStore, StorageError, StorageResult};

#[derive(Debug)]
struct FaultState {
    writes_left: AtomicUsize,
    fail_flush: AtomicBool,
    writes: AtomicUsize,
    injected: AtomicUsize,
}

/// Handle controlling when a [`FaultyBlockStore`] fails.
#[derive(Debug, Clone)]
pub struct FaultSwitch {
    state: Arc<FaultState>,
}

impl FaultSwitch {
    /// Lets `writes` more allocations or block writes succeed, then fails
    /// every following one.
    pub fn fail_after_writes(&self, writes: usize) {
        self.state.writes_left.store(writes, Ordering::SeqCst);
    }

    /// Sets whether flush and sync fail.
    pub fn set_fail_flush(&self, fail: bool) {
        self.state.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Stops injecting faults.
    pub fn reset(&self) {
        self.state.writes_left.store(usize::MAX, Ordering::SeqCst);
        self.state.fail_flush.store(false, Ordering::SeqCst);
    }

    /// Number of successful allocations and block writes so far.
    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> usize {
        self.state.injected.load(Ordering::SeqCst)
    }
}

/// An in-memory block store that fails on demand.
///
/// Reads and frees always pass through, so cleanup after a failed write
/// can be observed.
#[derive(Debug)]
pub struct FaultyBlockStore {
    inner: InMemoryBlockStore,
    state: Arc<FaultState>,
}

impl FaultyBlockStore {
    /// Creates a store with the given block size and its switch.
    pub fn new(block_size: usize) -> (Self, FaultSwitch) {
        let state = Arc::new(FaultState {
            writes_left: AtomicUsize::new(usize::MAX),
            fail_flush: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
            injected: AtomicUsize::new(0),
        });
        let store = Self {
            inner: InMemoryBlockStore::with_block_size(block_size),
            state: Arc::clone(&state),
        };
        (store, FaultSwitch { state })
    }

    fn take_write(&self, what: &str) -> StorageResult<()> {
        let granted = self
            .state
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if granted {
            self.state.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            Err(self.fault(what))
        }
    }

    fn fault(&self, what: &str) -> StorageError {
        self.state.injected.fetch_add(1, Ordering::SeqCst);
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected fault during {what}"),
        ))
    }
}

impl BlockStore for FaultyBlockStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn allocate(&mut self) -> StorageResult<BlockId> {
        self.take_write("allocate")?;
        self.inner.allocate()
    }

    fn read_block(&self, id: BlockId) -> StorageResult<Vec<u8>> {
        self.inner.read_block(id)
    }

    fn write_block(&mut self, id: BlockId, data: &[u8]) -> StorageResult<()> {
        self.take_write("write")?;
        self.inner.write_block(id, data)
    }

    fn free(&mut self, id: BlockId) -> StorageResult<()> {
        self.inner.free(id)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.state.fail_flush.load(Ordering::SeqCst) {
            return Err(self.fault("flush"));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.state.fail_flush.load(Ordering::SeqCst) {
            return Err(self.fault("sync"));
        }
        self.inner.sync()
    }

    fn live_blocks(&self) -> StorageResult<u64> {
        self.inner.live_blocks()
    }
}
