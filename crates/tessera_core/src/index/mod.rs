//! Copy-on-write row indexes.
//!
//! Every table keeps a set of ordered indexes over its row ids:
//!
//! - slot 0 orders all rows by row id
//! - slot `k + 1` orders rows by the cells of the k-th indexed column,
//!   ties broken by row id
//!
//! Committed indexes are chains of immutable, reference-counted blocks
//! owned by an [`IndexSetStore`]. Transactions work on a
//! [`SnapshotIndexSet`], which copies an index privately on first write.

mod block;
mod snapshot;
mod store;

pub use snapshot::{IndexIter, SnapshotIndexSet};
pub use store::{IndexSetStore, IndexStats};

pub(crate) use store::StagedIndexSet;

use crate::error::{CoreError, CoreResult};
use crate::table::Row;
use crate::types::RowId;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves row ids to row contents while indexes are being maintained.
pub trait RowSource {
    /// Returns the row, or `None` if the source does not know it.
    fn fetch(&self, id: RowId) -> Option<Arc<Row>>;
}

fn fetch_row(source: &dyn RowSource, id: RowId) -> CoreResult<Arc<Row>> {
    source
        .fetch(id)
        .ok_or_else(|| CoreError::index_corruption(format!("index names unknown {id}")))
}

fn cell(row: &Row, column: usize) -> &[u8] {
    row.cell(column).unwrap_or_default()
}

/// First position in `slot` whose `(key, id)` is not below the given pair.
fn seek(
    set: &SnapshotIndexSet,
    slot: usize,
    column: usize,
    key: &[u8],
    after: Option<RowId>,
    source: &dyn RowSource,
) -> CoreResult<usize> {
    let mut failure = None;
    let pos = set.partition_point(slot, |r| {
        if failure.is_some() {
            return false;
        }
        match fetch_row(source, r) {
            Ok(row) => match cell(&row, column).cmp(key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => after.is_some_and(|id| r < id),
            },
            Err(err) => {
                failure = Some(err);
                false
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(pos),
    }
}

/// Adds a row to every index of `set`.
///
/// `columns` lists the indexed column positions in slot order.
pub(crate) fn insert_row(
    set: &mut SnapshotIndexSet,
    columns: &[usize],
    id: RowId,
    row: &Row,
    source: &dyn RowSource,
) -> CoreResult<()> {
    let mut positions = Vec::with_capacity(columns.len() + 1);
    positions.push(set.partition_point(0, |r| r < id));
    for (k, &column) in columns.iter().enumerate() {
        positions.push(seek(set, k + 1, column, cell(row, column), Some(id), source)?);
    }

    for (slot, pos) in positions.into_iter().enumerate() {
        set.insert_at(slot, pos, id);
    }
    Ok(())
}

/// Removes a row from every index of `set`. Returns false if index 0
/// did not contain it.
///
/// `row` holds the cells the row was indexed under; each slot is
/// searched by key rather than scanned.
pub(crate) fn remove_row(
    set: &mut SnapshotIndexSet,
    columns: &[usize],
    id: RowId,
    row: &Row,
    source: &dyn RowSource,
) -> CoreResult<bool> {
    let first = set.partition_point(0, |r| r < id);
    if set.iter_from(0, first).next() != Some(id) {
        return Ok(false);
    }

    let mut positions = Vec::with_capacity(columns.len() + 1);
    positions.push(first);
    for (k, &column) in columns.iter().enumerate() {
        let slot = k + 1;
        let pos = seek(set, slot, column, cell(row, column), Some(id), source)?;
        if set.iter_from(slot, pos).next() != Some(id) {
            return Err(CoreError::index_corruption(format!(
                "{id} is missing from index {slot}"
            )));
        }
        positions.push(pos);
    }

    for (slot, pos) in positions.into_iter().enumerate() {
        set.remove_at(slot, pos);
    }
    Ok(true)
}

/// Removes every row of `ids` from every index of `set` in one pass per
/// slot.
///
/// Returns the first row index 0 does not contain; `set` is left
/// untouched in that case.
pub(crate) fn remove_rows(set: &mut SnapshotIndexSet, ids: &BTreeSet<RowId>) -> Option<RowId> {
    if let Some(&missing) = ids.iter().find(|&&id| !set.contains_row(id)) {
        return Some(missing);
    }
    if ids.is_empty() {
        return None;
    }
    for slot in 0..set.index_count() {
        set.retain(slot, |r| !ids.contains(r));
    }
    None
}

/// Row ids in `slot` whose cell in `column` equals `key`, in row id order.
pub(crate) fn lookup(
    set: &SnapshotIndexSet,
    slot: usize,
    column: usize,
    key: &[u8],
    source: &dyn RowSource,
) -> CoreResult<Vec<RowId>> {
    let start = seek(set, slot, column, key, None, source)?;
    let mut found = Vec::new();
    for id in set.iter_from(slot, start) {
        let row = fetch_row(source, id)?;
        if cell(&row, column) != key {
            break;
        }
        found.push(id);
    }
    Ok(found)
}

/// First pair of adjacent rows in `slot` sharing a key.
pub(crate) fn find_duplicate(
    set: &SnapshotIndexSet,
    slot: usize,
    column: usize,
    source: &dyn RowSource,
) -> CoreResult<Option<RowId>> {
    let mut previous: Option<Arc<Row>> = None;
    for id in set.iter(slot) {
        let row = fetch_row(source, id)?;
        if previous.as_ref().is_some_and(|p| cell(p, column) == cell(&row, column)) {
            return Ok(Some(id));
        }
        previous = Some(row);
    }
    Ok(None)
}

/// An ordered view over one indexed column, as seen by a transaction.
pub struct ColumnIndex<'a> {
    set: &'a SnapshotIndexSet,
    slot: usize,
    column: usize,
    source: &'a dyn RowSource,
}

impl<'a> ColumnIndex<'a> {
    pub(crate) fn new(
        set: &'a SnapshotIndexSet,
        slot: usize,
        column: usize,
        source: &'a dyn RowSource,
    ) -> Self {
        Self {
            set,
            slot,
            column,
            source,
        }
    }

    /// Rows whose cell equals `key`, in row id order.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorruption` if the index names a row the transaction
    /// cannot resolve.
    pub fn lookup(&self, key: &[u8]) -> CoreResult<Vec<RowId>> {
        lookup(self.set, self.slot, self.column, key, self.source)
    }

    /// Iterates row ids in key order.
    pub fn iter(&self) -> IndexIter<'a> {
        self.set.iter(self.slot)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len(self.slot)
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ColumnIndex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnIndex")
            .field("slot", &self.slot)
            .field("column", &self.column)
            .field("len", &self.len())
            .finish()
    }
}
