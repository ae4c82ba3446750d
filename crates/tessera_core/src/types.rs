//! Core type definitions for Tessera.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tessera_storage::BlockStore;

pub use tessera_storage::BlockId;

/// A block store shared between every table of a conglomerate.
pub type SharedBlockStore = Arc<RwLock<Box<dyn BlockStore>>>;

/// Wraps a block store for sharing between tables.
#[must_use]
pub fn share_store(store: Box<dyn BlockStore>) -> SharedBlockStore {
    Arc::new(RwLock::new(store))
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Logical clock of transaction epochs.
///
/// Every closed transaction, committed or rolled back, advances the
/// conglomerate's commit id by exactly one. A transaction sees every
/// commit tagged with an id at or below its start commit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(pub u64);

impl CommitId {
    /// Creates a new commit id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next commit id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit:{}", self.0)
    }
}

/// Stable identifier of a table.
///
/// Table ids are assigned when a table is created and never reused,
/// even after the table is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

impl TableId {
    /// Creates a new table ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

/// Identifier of a row within one table.
///
/// Row ids are unique per table and increase in allocation order. An
/// updated row receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);

impl RowId {
    /// Creates a new row ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        let t1 = TransactionId::new(1);
        let t2 = TransactionId::new(2);
        assert!(t1 < t2);
    }

    #[test]
    fn commit_id_next() {
        let c = CommitId::new(5);
        assert_eq!(c.next().as_u64(), 6);
        assert!(c.next() > c);
    }

    #[test]
    fn display_formats() {
        assert_eq!(format!("{}", TableId::new(42)), "tbl:42");
        assert_eq!(format!("{}", RowId::new(7)), "row:7");
        assert_eq!(format!("{}", CommitId::new(3)), "commit:3");
        assert_eq!(format!("{}", TransactionId::new(9)), "txn:9");
    }
}
