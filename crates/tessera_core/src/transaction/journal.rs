//! Per-transaction change journal.

use crate::types::{RowId, TableId};
use std::collections::{BTreeMap, BTreeSet};

/// One recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    /// A table was created.
    CreateTable {
        /// The new table.
        table: TableId,
    },
    /// A table was dropped.
    DropTable {
        /// The dropped table.
        table: TableId,
    },
    /// A row was inserted.
    AddRow {
        /// Target table.
        table: TableId,
        /// The new row.
        row: RowId,
    },
    /// A row was removed.
    RemoveRow {
        /// Target table.
        table: TableId,
        /// The removed row.
        row: RowId,
    },
    /// The new version of an updated row.
    UpdateAddRow {
        /// Target table.
        table: TableId,
        /// The replacement row.
        row: RowId,
    },
    /// The old version of an updated row.
    UpdateRemoveRow {
        /// Target table.
        table: TableId,
        /// The replaced row.
        row: RowId,
    },
    /// A column's unique constraint was switched on or off.
    ConstraintAlter {
        /// Target table.
        table: TableId,
        /// Column position.
        column: usize,
        /// New unique flag.
        unique: bool,
    },
}

impl JournalEntry {
    /// Returns the table the entry touches.
    #[must_use]
    pub fn table(&self) -> TableId {
        match *self {
            Self::CreateTable { table }
            | Self::DropTable { table }
            | Self::AddRow { table, .. }
            | Self::RemoveRow { table, .. }
            | Self::UpdateAddRow { table, .. }
            | Self::UpdateRemoveRow { table, .. }
            | Self::ConstraintAlter { table, .. } => table,
        }
    }

    /// Returns the row the entry touches, if any.
    #[must_use]
    pub fn row(&self) -> Option<RowId> {
        match *self {
            Self::AddRow { row, .. }
            | Self::RemoveRow { row, .. }
            | Self::UpdateAddRow { row, .. }
            | Self::UpdateRemoveRow { row, .. } => Some(row),
            _ => None,
        }
    }
}

/// Net effect of a transaction on one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableChanges {
    /// Rows added and still present at commit.
    pub added: BTreeSet<RowId>,
    /// Committed rows removed.
    pub removed: BTreeSet<RowId>,
    /// The table was created by the transaction.
    pub created: bool,
    /// The table was dropped by the transaction.
    pub dropped: bool,
    /// Unique constraints were altered.
    pub constraints_altered: bool,
}

impl TableChanges {
    /// Whether rows were added or removed.
    #[must_use]
    pub fn has_row_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Whether anything at all changed.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.has_row_changes() || self.created || self.dropped || self.constraints_altered
    }
}

/// Append-only log of a transaction's changes.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Returns all entries in order.
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds the journal into net changes per table.
    ///
    /// A row added and later removed inside the transaction cancels out.
    /// A table created and dropped inside the transaction disappears.
    /// Tables with no net change are omitted.
    #[must_use]
    pub fn normalize(&self) -> BTreeMap<TableId, TableChanges> {
        let mut tables: BTreeMap<TableId, TableChanges> = BTreeMap::new();

        for entry in &self.entries {
            let changes = tables.entry(entry.table()).or_default();
            match *entry {
                JournalEntry::CreateTable { .. } => changes.created = true,
                JournalEntry::DropTable { .. } => changes.dropped = true,
                JournalEntry::AddRow { row, .. } | JournalEntry::UpdateAddRow { row, .. } => {
                    changes.added.insert(row);
                }
                JournalEntry::RemoveRow { row, .. } | JournalEntry::UpdateRemoveRow { row, .. } => {
                    if !changes.added.remove(&row) {
                        changes.removed.insert(row);
                    }
                }
                JournalEntry::ConstraintAlter { .. } => changes.constraints_altered = true,
            }
        }

        tables.retain(|_, changes| !(changes.created && changes.dropped) && changes.is_modified());
        tables
    }
}
