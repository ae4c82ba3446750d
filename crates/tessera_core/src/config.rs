//! Conglomerate configuration.

use std::time::Duration;

/// Smallest block size the core accepts.
///
/// An index block must hold at least a handful of row ids and a row
/// block at least a short row.
pub const MIN_BLOCK_SIZE: usize = 64;

/// When tombstoned rows and unreferenced blocks are reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Collect on the closing thread once no transaction is open. The
    /// commit mutex is held for the whole pass.
    Inline,
    /// Wake the conglomerate's collector thread once no transaction is
    /// open. Wake-ups arriving during a pass are merged.
    Background,
    /// Collect only when `Conglomerate::collect_garbage` is called.
    Manual,
}

/// Configuration for opening a conglomerate.
#[derive(Debug, Clone)]
pub struct Config {
    /// Block size for stores created by the conglomerate itself.
    pub block_size: usize,

    /// How long `Locker::lock` waits before giving up.
    pub lock_timeout: Duration,

    /// Garbage collection policy.
    pub cleanup: CleanupMode,

    /// Default dirty-select policy for new transactions.
    pub dirty_select: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            lock_timeout: Duration::from_secs(5),
            cleanup: CleanupMode::Background,
            dirty_select: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size used by `in_memory` and `open_file`.
    #[must_use]
    pub const fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the garbage collection policy.
    #[must_use]
    pub const fn cleanup(mut self, mode: CleanupMode) -> Self {
        self.cleanup = mode;
        self
    }

    /// Sets the default dirty-select policy.
    #[must_use]
    pub const fn dirty_select(mut self, value: bool) -> Self {
        self.dirty_select = value;
        self
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Fail fast when reading a row removed by a concurrent commit.
    pub dirty_select: bool,
}

impl TransactionOptions {
    /// Creates options with every policy off.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dirty_select: false,
        }
    }

    /// Sets the dirty-select policy.
    #[must_use]
    pub const fn dirty_select(mut self, value: bool) -> Self {
        self.dirty_select = value;
        self
    }
}
