//! Error types for Tessera core.

use crate::transaction::TransactionState;
use crate::types::{RowId, TableId};
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Why a commit was rejected by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// A row this transaction removed was removed by a concurrent commit.
    RowRemoved(RowId),
    /// The table was dropped by a concurrent commit.
    TableDropped,
    /// This transaction dropped a table a concurrent commit modified.
    TableModified,
    /// A table with the same name became visible concurrently.
    TableNameClash(String),
    /// Both transactions altered the table's constraints.
    ConstraintAltered,
    /// Committing would put two rows with equal keys into a unique column.
    UniqueViolation {
        /// The unique column.
        column: String,
        /// One of the rows sharing the key.
        row: RowId,
    },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowRemoved(row) => write!(f, "{row} was removed concurrently"),
            Self::TableDropped => write!(f, "table was dropped concurrently"),
            Self::TableModified => write!(f, "dropped table was modified concurrently"),
            Self::TableNameClash(name) => write!(f, "table name '{name}' is already taken"),
            Self::ConstraintAltered => write!(f, "constraints were altered concurrently"),
            Self::UniqueViolation { column, row } => {
                write!(f, "unique column '{column}' violated by {row}")
            }
        }
    }
}

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Block store error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// Commit validation found an overlapping concurrent change.
    #[error("transaction conflict on {table}: {kind}")]
    Conflict {
        /// The table where the conflict occurred.
        table: TableId,
        /// What collided.
        kind: ConflictKind,
    },

    /// A row read by a dirty-select transaction was removed concurrently.
    #[error("dirty read in {table}: {row:?} removed by a concurrent commit")]
    DirtyRead {
        /// The table read from.
        table: TableId,
        /// The removed row, when known.
        row: Option<RowId>,
    },

    /// The transaction has already committed or rolled back.
    #[error("transaction closed: already {state:?}")]
    TransactionClosed {
        /// The terminal state reached.
        state: TransactionState,
    },

    /// A lock could not be acquired in time. Nothing was acquired.
    #[error("lock timeout after {millis} ms on {resources:?}")]
    LockTimeout {
        /// The requested resources.
        resources: Vec<TableId>,
        /// How long the caller waited.
        millis: u64,
    },

    /// Table not visible to the transaction.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with this name is already visible.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// Row not visible to the transaction.
    #[error("{row} not found in {table}")]
    RowNotFound {
        /// The table searched.
        table: TableId,
        /// The missing row.
        row: RowId,
    },

    /// Column does not exist or cannot serve the request.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// Schema rejected.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// Row width does not match the table.
    #[error("row has {actual} cells, table has {expected} columns")]
    ColumnCountMismatch {
        /// Number of columns in the table.
        expected: usize,
        /// Number of cells supplied.
        actual: usize,
    },

    /// Encoded row does not fit into a block.
    #[error("row of {len} bytes exceeds block size {block_size}")]
    RowTooLarge {
        /// Encoded row length.
        len: usize,
        /// Block size of the store.
        block_size: usize,
    },

    /// A block record failed its checksum.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum of the bytes read.
        actual: u32,
    },

    /// A block does not hold a well-formed record.
    #[error("block corruption: {message}")]
    BlockCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// In-memory index state disagrees with itself or the store.
    #[error("index corruption: {message}")]
    IndexCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(table: TableId, kind: ConflictKind) -> Self {
        Self::Conflict { table, kind }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a block corruption error.
    pub fn block_corruption(message: impl Into<String>) -> Self {
        Self::BlockCorruption {
            message: message.into(),
        }
    }

    /// Creates an index corruption error.
    pub fn index_corruption(message: impl Into<String>) -> Self {
        Self::IndexCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for commit-time conflicts, including dirty reads.
    ///
    /// Callers that implement retry loops should retry only these.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::DirtyRead { .. })
    }
}
