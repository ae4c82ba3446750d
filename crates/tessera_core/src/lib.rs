//! # Tessera Core
//!
//! Transactional table core for Tessera.
//!
//! This crate provides:
//! - A [`Conglomerate`] owning every table and the commit clock
//! - [`Transaction`]s with snapshot isolation over copy-on-write indexes
//! - Journal based validation of concurrent commits
//! - Reference-counted index blocks with deferred reclamation
//! - A table [`Locker`] for callers that need stricter ordering
//!
//! ## Example
//!
//! ```
//! use tessera_core::{ColumnDef, Conglomerate, Row, TableSchema};
//!
//! let db = Conglomerate::in_memory();
//! let schema = TableSchema::new("cities")
//!     .column(ColumnDef::new("name").unique())
//!     .column(ColumnDef::new("country").indexed());
//!
//! let mut txn = db.create_transaction().unwrap();
//! let cities = txn.create_table(schema).unwrap();
//! txn.insert_row(cities, Row::from_strs(&["Oslo", "NO"])).unwrap();
//! txn.insert_row(cities, Row::from_strs(&["Bergen", "NO"])).unwrap();
//! txn.commit().unwrap();
//!
//! let reader = db.create_transaction().unwrap();
//! let by_country = reader.column_index(cities, "country").unwrap();
//! assert_eq!(by_country.lookup(b"NO").unwrap().len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod conglomerate;
mod error;
mod index;
mod locker;
mod schema;
mod table;
mod transaction;
mod types;

pub use config::{CleanupMode, Config, TransactionOptions, MIN_BLOCK_SIZE};
pub use conglomerate::{Conglomerate, GcStats};
pub use error::{ConflictKind, CoreError, CoreResult};
pub use index::{ColumnIndex, IndexIter, IndexSetStore, IndexStats, RowSource, SnapshotIndexSet};
pub use locker::{LockHandle, LockMode, LockOwner, Locker};
pub use schema::{ColumnDef, TableSchema};
pub use table::{MasterTableSource, PurgeStats, Row};
pub use transaction::{Journal, JournalEntry, TableChanges, Transaction, TransactionState};
pub use types::{share_store, BlockId, CommitId, RowId, SharedBlockStore, TableId, TransactionId};

// Re-export storage types for convenience
pub use tessera_storage::{BlockStore, FileBlockStore, InMemoryBlockStore, StorageError};
