//! Transactions and their private table views.

use crate::config::TransactionOptions;
use crate::conglomerate::Shared;
use crate::error::{ConflictKind, CoreError, CoreResult};
use crate::index::{self, ColumnIndex, IndexIter, RowSource, SnapshotIndexSet};
use crate::locker::{LockHandle, LockMode, LockOwner};
use crate::schema::TableSchema;
use crate::table::{MasterTableSource, Row};
use crate::transaction::journal::{Journal, JournalEntry};
use crate::types::{CommitId, RowId, TableId, TransactionId};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is open and can perform operations.
    Open,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back.
    RolledBack,
}

/// A transaction's view of one table.
#[derive(Debug)]
pub(crate) struct TableView {
    pub(crate) master: Arc<MasterTableSource>,
    pub(crate) schema: TableSchema,
    pub(crate) indexes: SnapshotIndexSet,
    /// Rows inserted by the transaction, not yet committed.
    pub(crate) pending: HashMap<RowId, Arc<Row>>,
    /// Set once the transaction reads from the table.
    pub(crate) selected: Cell<bool>,
    pub(crate) created: bool,
    pub(crate) dropped: bool,
}

impl TableView {
    pub(crate) fn new(master: Arc<MasterTableSource>, indexes: SnapshotIndexSet, created: bool) -> Self {
        Self {
            schema: master.schema(),
            master,
            indexes,
            pending: HashMap::new(),
            selected: Cell::new(false),
            created,
            dropped: false,
        }
    }
}

impl RowSource for TableView {
    fn fetch(&self, id: RowId) -> Option<Arc<Row>> {
        fetch(&self.pending, &self.master, id)
    }
}

/// Row lookup over split borrows of a view, used while its indexes are
/// borrowed mutably.
struct ViewSource<'a> {
    pending: &'a HashMap<RowId, Arc<Row>>,
    master: &'a MasterTableSource,
}

impl RowSource for ViewSource<'_> {
    fn fetch(&self, id: RowId) -> Option<Arc<Row>> {
        fetch(self.pending, self.master, id)
    }
}

fn fetch(pending: &HashMap<RowId, Arc<Row>>, master: &MasterTableSource, id: RowId) -> Option<Arc<Row>> {
    pending.get(&id).cloned().or_else(|| master.row(id))
}

/// An open unit of work bound to one snapshot of the conglomerate.
///
/// Reads see the tables as committed when the transaction was created,
/// plus the transaction's own changes. Writes go to private copies of
/// the affected indexes and are recorded in the journal; nothing reaches
/// the master tables before [`Transaction::commit`].
///
/// Dropping an open transaction rolls it back.
pub struct Transaction {
    id: TransactionId,
    start: CommitId,
    options: TransactionOptions,
    shared: Arc<Shared>,
    pub(crate) views: BTreeMap<TableId, TableView>,
    pub(crate) journal: Journal,
    locks: Vec<LockHandle>,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        start: CommitId,
        options: TransactionOptions,
        shared: Arc<Shared>,
        views: BTreeMap<TableId, TableView>,
    ) -> Self {
        Self {
            id,
            start,
            options,
            shared,
            views,
            journal: Journal::new(),
            locks: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the commit id the snapshot was taken at.
    #[must_use]
    pub fn start_commit_id(&self) -> CommitId {
        self.start
    }

    /// Returns the options the transaction was created with.
    #[must_use]
    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Returns the changes recorded so far.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Number of lock handles held.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Ids of the tables visible to this transaction.
    #[must_use]
    pub fn tables(&self) -> Vec<TableId> {
        self.views
            .iter()
            .filter(|(_, v)| !v.dropped)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Looks up a visible table by name.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if no visible table has this name.
    pub fn table_id(&self, name: &str) -> CoreResult<TableId> {
        self.views
            .iter()
            .find(|(_, v)| !v.dropped && v.schema.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| CoreError::TableNotFound(name.to_string()))
    }

    /// Returns a table's schema as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible.
    pub fn schema(&self, table: TableId) -> CoreResult<&TableSchema> {
        Ok(&self.view(table)?.schema)
    }

    /// Creates a table visible only to this transaction until commit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` for a bad schema and `TableExists` if the
    /// name is already visible.
    pub fn create_table(&mut self, schema: TableSchema) -> CoreResult<TableId> {
        self.ensure_open()?;
        schema.validate()?;
        if self.table_id(&schema.name).is_ok() {
            return Err(CoreError::TableExists(schema.name));
        }

        let id = self.shared.allocate_table_id();
        let master = Arc::new(MasterTableSource::new(id, schema, self.shared.store()));
        let indexes = master.create_index_set()?;
        self.views.insert(id, TableView::new(master, indexes, true));
        self.journal.push(JournalEntry::CreateTable { table: id });
        debug!(txn = %self.id, table = %id, "table created");
        Ok(id)
    }

    /// Drops a table. A table other transactions can see is locked
    /// exclusively until this transaction closes.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible and
    /// `LockTimeout` if the lock cannot be taken.
    pub fn drop_table(&mut self, table: TableId) -> CoreResult<()> {
        self.ensure_open()?;
        if !self.view(table)?.created {
            self.lock_tables(&[table], LockMode::Exclusive)?;
        }

        let view = self.view_mut(table)?;
        view.dropped = true;
        view.pending.clear();
        self.journal.push(JournalEntry::DropTable { table });
        Ok(())
    }

    /// Switches the unique constraint of an indexed column.
    ///
    /// Takes an exclusive lock on the table until the transaction closes.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column, `InvalidOperation`
    /// for an unindexed one, and a `UniqueViolation` conflict when making
    /// a column unique that already holds duplicates.
    pub fn alter_constraints(&mut self, table: TableId, column: &str, unique: bool) -> CoreResult<()> {
        self.ensure_open()?;
        let view = self.view(table)?;
        let position = view
            .schema
            .column_position(column)
            .ok_or_else(|| CoreError::ColumnNotFound(column.to_string()))?;
        let Some(slot) = view.schema.index_slot(position) else {
            return Err(CoreError::invalid_operation(format!(
                "column '{column}' is not indexed"
            )));
        };
        if view.schema.columns[position].unique == unique {
            return Ok(());
        }
        if unique {
            if let Some(row) = index::find_duplicate(&view.indexes, slot, position, view)? {
                return Err(CoreError::conflict(
                    table,
                    ConflictKind::UniqueViolation {
                        column: column.to_string(),
                        row,
                    },
                ));
            }
        }

        self.lock_tables(&[table], LockMode::Exclusive)?;
        let view = self.view_mut(table)?;
        view.schema.columns[position].unique = unique;
        self.journal.push(JournalEntry::ConstraintAlter {
            table,
            column: position,
            unique,
        });
        Ok(())
    }

    /// Locks tables for the rest of the transaction.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the locks cannot all be granted in time.
    pub fn lock_tables(&mut self, tables: &[TableId], mode: LockMode) -> CoreResult<()> {
        self.ensure_open()?;
        let locker = self.shared.locker();
        let handle = locker.lock_for(LockOwner::Transaction(self.id), tables, mode, locker.timeout())?;
        self.locks.push(handle);
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Inserts a row and returns its new id.
    ///
    /// # Errors
    ///
    /// Returns `ColumnCountMismatch`, `RowTooLarge`, or a `UniqueViolation`
    /// conflict against rows this transaction can see.
    pub fn insert_row(&mut self, table: TableId, row: Row) -> CoreResult<RowId> {
        self.ensure_open()?;
        self.check_row(table, &row, None)?;
        let id = self.add_row(table, row)?;
        self.journal.push(JournalEntry::AddRow { table, row: id });
        Ok(id)
    }

    /// Removes a visible row.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible.
    pub fn remove_row(&mut self, table: TableId, row: RowId) -> CoreResult<()> {
        self.ensure_open()?;
        self.delete_row(table, row)?;
        self.journal.push(JournalEntry::RemoveRow { table, row });
        Ok(())
    }

    /// Replaces a row. The new version gets a fresh row id, which is
    /// returned.
    ///
    /// # Errors
    ///
    /// As [`Transaction::insert_row`] and [`Transaction::remove_row`]. On
    /// error nothing changes.
    pub fn update_row(&mut self, table: TableId, row: RowId, new: Row) -> CoreResult<RowId> {
        self.ensure_open()?;
        if !self.view(table)?.indexes.contains_row(row) {
            return Err(CoreError::RowNotFound { table, row });
        }
        self.check_row(table, &new, Some(row))?;

        self.delete_row(table, row)?;
        self.journal.push(JournalEntry::UpdateRemoveRow { table, row });
        let id = self.add_row(table, new)?;
        self.journal.push(JournalEntry::UpdateAddRow { table, row: id });
        Ok(id)
    }

    /// Reads a visible row.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible, or `DirtyRead` in
    /// dirty-select mode when a later commit removed it.
    pub fn get_row(&self, table: TableId, row: RowId) -> CoreResult<Arc<Row>> {
        self.ensure_open()?;
        let view = self.view(table)?;
        view.selected.set(true);
        if !view.indexes.contains_row(row) {
            return Err(CoreError::RowNotFound { table, row });
        }
        if let Some(pending) = view.pending.get(&row) {
            return Ok(Arc::clone(pending));
        }
        if self.options.dirty_select
            && view.master.removed_at(row).is_some_and(|at| at > self.start)
        {
            return Err(CoreError::DirtyRead {
                table,
                row: Some(row),
            });
        }
        view.master.row(row).ok_or_else(|| {
            CoreError::index_corruption(format!("{table} index names {row} with no contents"))
        })
    }

    /// Iterates the visible row ids of a table in row id order.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible.
    pub fn row_ids(&self, table: TableId) -> CoreResult<IndexIter<'_>> {
        self.ensure_open()?;
        let view = self.view(table)?;
        view.selected.set(true);
        Ok(view.indexes.iter(0))
    }

    /// Number of rows visible in a table.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if the table is not visible.
    pub fn row_count(&self, table: TableId) -> CoreResult<usize> {
        self.ensure_open()?;
        Ok(self.view(table)?.indexes.row_count())
    }

    /// Returns the ordered index over an indexed column.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column and
    /// `InvalidOperation` for an unindexed one.
    pub fn column_index(&self, table: TableId, column: &str) -> CoreResult<ColumnIndex<'_>> {
        self.ensure_open()?;
        let view = self.view(table)?;
        let position = view
            .schema
            .column_position(column)
            .ok_or_else(|| CoreError::ColumnNotFound(column.to_string()))?;
        let slot = view.schema.index_slot(position).ok_or_else(|| {
            CoreError::invalid_operation(format!("column '{column}' is not indexed"))
        })?;
        view.selected.set(true);
        Ok(ColumnIndex::new(&view.indexes, slot, position, view))
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Validates and publishes the transaction's changes.
    ///
    /// Returns the commit id the changes were published under. On error
    /// the transaction stays open and nothing was published; the caller
    /// decides whether to roll back.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` or `DirtyRead` when validation fails, or the
    /// storage error that interrupted staging.
    pub fn commit(&mut self) -> CoreResult<CommitId> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let (commit, idle) = shared.commit(self)?;
        self.finish(TransactionState::Committed);
        if idle {
            shared.on_idle();
        }
        Ok(commit)
    }

    /// Discards every change and closes the transaction.
    ///
    /// # Errors
    ///
    /// Returns `TransactionClosed` if the transaction is already closed.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let idle = shared.close(self.id);
        self.finish(TransactionState::RolledBack);
        if idle {
            shared.on_idle();
        }
        Ok(())
    }

    fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.views.clear();
        self.journal = Journal::new();
        for handle in self.locks.drain(..) {
            handle.release();
        }
        debug!(txn = %self.id, ?state, "transaction closed");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_open(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            state => Err(CoreError::TransactionClosed { state }),
        }
    }

    fn view(&self, table: TableId) -> CoreResult<&TableView> {
        self.views
            .get(&table)
            .filter(|v| !v.dropped)
            .ok_or_else(|| CoreError::TableNotFound(table.to_string()))
    }

    fn view_mut(&mut self, table: TableId) -> CoreResult<&mut TableView> {
        self.views
            .get_mut(&table)
            .filter(|v| !v.dropped)
            .ok_or_else(|| CoreError::TableNotFound(table.to_string()))
    }

    /// Checks width, encoded size and unique columns of a row about to be
    /// added. `replacing` is excluded from the unique check.
    fn check_row(&self, table: TableId, row: &Row, replacing: Option<RowId>) -> CoreResult<()> {
        let view = self.view(table)?;
        if row.len() != view.schema.columns.len() {
            return Err(CoreError::ColumnCountMismatch {
                expected: view.schema.columns.len(),
                actual: row.len(),
            });
        }
        let block_size = view.master.block_size();
        if row.encoded_len() > block_size {
            return Err(CoreError::RowTooLarge {
                len: row.encoded_len(),
                block_size,
            });
        }

        for (position, column) in view.schema.columns.iter().enumerate() {
            if !column.unique {
                continue;
            }
            let Some(slot) = view.schema.index_slot(position) else {
                continue;
            };
            let key = row.cell(position).unwrap_or_default();
            let found = index::lookup(&view.indexes, slot, position, key, view)?;
            if let Some(&other) = found.iter().find(|&&r| Some(r) != replacing) {
                return Err(CoreError::conflict(
                    table,
                    ConflictKind::UniqueViolation {
                        column: column.name.clone(),
                        row: other,
                    },
                ));
            }
        }
        Ok(())
    }

    fn add_row(&mut self, table: TableId, row: Row) -> CoreResult<RowId> {
        let view = self.view_mut(table)?;
        let id = view.master.reserve_row_id();
        let row = Arc::new(row);
        let TableView {
            master,
            indexes,
            pending,
            ..
        } = view;
        let source = ViewSource {
            pending: &*pending,
            master: &**master,
        };
        index::insert_row(indexes, master.index_columns(), id, &row, &source)?;
        pending.insert(id, row);
        Ok(id)
    }

    fn delete_row(&mut self, table: TableId, row: RowId) -> CoreResult<()> {
        let view = self.view_mut(table)?;
        let TableView {
            master,
            indexes,
            pending,
            ..
        } = view;
        let Some(contents) = fetch(&*pending, &**master, row) else {
            return Err(CoreError::RowNotFound { table, row });
        };
        let source = ViewSource {
            pending: &*pending,
            master: &**master,
        };
        if !index::remove_row(indexes, master.index_columns(), row, &contents, &source)? {
            return Err(CoreError::RowNotFound { table, row });
        }
        pending.remove(&row);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.rollback() {
                warn!(txn = %self.id, error = %err, "rollback on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("state", &self.state)
            .field("tables", &self.views.len())
            .field("journal", &self.journal.len())
            .finish_non_exhaustive()
    }
}
