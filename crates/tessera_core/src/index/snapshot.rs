//! Copy-on-write snapshot of a table's indexes.

use crate::index::store::IndexSetStore;
use crate::types::{BlockId, RowId, TableId};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) enum IndexView {
    /// Untouched: reads go straight to the published block contents.
    Shared(Vec<Arc<[RowId]>>),
    /// Written at least once: a private copy owned by this snapshot.
    Private(Vec<RowId>),
}

/// A per-transaction, copy-on-write view of a table's indexes.
///
/// Creating the snapshot takes one reference on every index block that
/// was current at that moment. Reads never allocate. The first write to
/// an index copies just that index into a private vector; other indexes
/// and other snapshots keep sharing the blocks.
///
/// References are released exactly once, by [`SnapshotIndexSet::dispose`]
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct SnapshotIndexSet {
    store: Arc<IndexSetStore>,
    views: Vec<IndexView>,
    referenced: Vec<BlockId>,
    disposed: bool,
}

impl SnapshotIndexSet {
    pub(crate) fn new(
        store: Arc<IndexSetStore>,
        views: Vec<IndexView>,
        referenced: Vec<BlockId>,
    ) -> Self {
        Self {
            store,
            views,
            referenced,
            disposed: false,
        }
    }

    /// Returns the table this snapshot belongs to.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.store.table()
    }

    /// Number of indexes in the set.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.views.len()
    }

    /// Number of row ids in one index.
    #[must_use]
    pub fn len(&self, index: usize) -> usize {
        match self.views.get(index) {
            Some(IndexView::Shared(blocks)) => blocks.iter().map(|b| b.len()).sum(),
            Some(IndexView::Private(rows)) => rows.len(),
            None => 0,
        }
    }

    /// Number of rows visible through this snapshot.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.len(0)
    }

    /// Iterates one index in order.
    #[must_use]
    pub fn iter(&self, index: usize) -> IndexIter<'_> {
        self.iter_from(index, 0)
    }

    /// Iterates one index in order, starting at position `start`.
    #[must_use]
    pub fn iter_from(&self, index: usize, start: usize) -> IndexIter<'_> {
        let inner = match self.views.get(index) {
            Some(IndexView::Shared(blocks)) => {
                let mut block = 0;
                let mut pos = start;
                while let Some(b) = blocks.get(block) {
                    if pos < b.len() {
                        break;
                    }
                    pos -= b.len();
                    block += 1;
                }
                IterInner::Shared { blocks, block, pos }
            }
            Some(IndexView::Private(rows)) => {
                IterInner::Private(rows.get(start..).unwrap_or(&[]).iter())
            }
            None => IterInner::Private(<&[RowId]>::default().iter()),
        };
        IndexIter { inner }
    }

    /// Whether an index has been copied privately.
    #[must_use]
    pub fn is_private(&self, index: usize) -> bool {
        matches!(self.views.get(index), Some(IndexView::Private(_)))
    }

    /// Whether any index has been written.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.views.iter().any(|v| matches!(v, IndexView::Private(_)))
    }

    /// Whether index 0 contains the row.
    #[must_use]
    pub fn contains_row(&self, row: RowId) -> bool {
        let pos = self.partition_point(0, |r| r < row);
        self.iter_from(0, pos).next() == Some(row)
    }

    /// Blocks this snapshot holds a reference on.
    #[must_use]
    pub fn referenced_blocks(&self) -> &[BlockId] {
        &self.referenced
    }

    /// Whether the references have been released.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Releases every block reference held by this snapshot.
    ///
    /// Calling this more than once is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.store.release(&self.referenced);
    }

    /// First position whose row id does not satisfy `pred`.
    ///
    /// The index must be partitioned by `pred`: every satisfying row id
    /// precedes every other.
    pub(crate) fn partition_point(&self, index: usize, mut pred: impl FnMut(RowId) -> bool) -> usize {
        match self.views.get(index) {
            Some(IndexView::Shared(blocks)) => {
                let mut skipped = 0;
                for block in blocks {
                    let within = block.partition_point(|&r| pred(r));
                    if within < block.len() {
                        return skipped + within;
                    }
                    skipped += block.len();
                }
                skipped
            }
            Some(IndexView::Private(rows)) => rows.partition_point(|&r| pred(r)),
            None => 0,
        }
    }

    pub(crate) fn insert_at(&mut self, index: usize, pos: usize, row: RowId) {
        if let Some(rows) = self.make_private(index) {
            rows.insert(pos.min(rows.len()), row);
        }
    }

    /// Removes the row id at `pos`.
    pub(crate) fn remove_at(&mut self, index: usize, pos: usize) -> Option<RowId> {
        let rows = self.make_private(index)?;
        (pos < rows.len()).then(|| rows.remove(pos))
    }

    pub(crate) fn retain(&mut self, index: usize, keep: impl FnMut(&RowId) -> bool) {
        if let Some(rows) = self.make_private(index) {
            rows.retain(keep);
        }
    }

    pub(crate) fn private_rows(&self, index: usize) -> Option<&[RowId]> {
        match self.views.get(index) {
            Some(IndexView::Private(rows)) => Some(rows),
            _ => None,
        }
    }

    fn make_private(&mut self, index: usize) -> Option<&mut Vec<RowId>> {
        let view = self.views.get_mut(index)?;
        if let IndexView::Shared(blocks) = view {
            let copy: Vec<RowId> = blocks.iter().flat_map(|b| b.iter().copied()).collect();
            *view = IndexView::Private(copy);
        }
        match view {
            IndexView::Private(rows) => Some(rows),
            IndexView::Shared(_) => None,
        }
    }
}

impl Drop for SnapshotIndexSet {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// In-order iterator over one index of a snapshot.
#[derive(Debug)]
pub struct IndexIter<'a> {
    inner: IterInner<'a>,
}

#[derive(Debug)]
enum IterInner<'a> {
    Shared {
        blocks: &'a [Arc<[RowId]>],
        block: usize,
        pos: usize,
    },
    Private(std::slice::Iter<'a, RowId>),
}

impl Iterator for IndexIter<'_> {
    type Item = RowId;

    fn next(&mut self) -> Option<RowId> {
        match &mut self.inner {
            IterInner::Shared { blocks, block, pos } => loop {
                let current = blocks.get(*block)?;
                if let Some(&row) = current.get(*pos) {
                    *pos += 1;
                    return Some(row);
                }
                *block += 1;
                *pos = 0;
            },
            IterInner::Private(iter) => iter.next().copied(),
        }
    }
}
