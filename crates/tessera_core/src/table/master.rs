//! Master table sources.

use crate::error::{ConflictKind, CoreError, CoreResult};
use crate::index::{self, IndexSetStore, RowSource, SnapshotIndexSet, StagedIndexSet};
use crate::schema::TableSchema;
use crate::table::Row;
use crate::transaction::TableChanges;
use crate::types::{BlockId, CommitId, RowId, SharedBlockStore, TableId};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug)]
struct RowEntry {
    row: Arc<Row>,
    block: BlockId,
    /// Commit that tombstoned the row. Snapshots taken earlier still see it.
    removed_at: Option<CommitId>,
}

/// Committed rows of one table.
///
/// Tombstones are also queued under the commit that removed them, so
/// collection visits only the rows it frees.
#[derive(Debug, Default)]
struct RowSet {
    entries: HashMap<RowId, RowEntry>,
    tombstones: BTreeMap<CommitId, Vec<RowId>>,
    tombstoned: usize,
}

impl RowSet {
    fn tombstone(&mut self, id: RowId, commit: CommitId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.removed_at.is_none() {
                entry.removed_at = Some(commit);
                self.tombstones.entry(commit).or_default().push(id);
                self.tombstoned += 1;
            }
        }
    }

    /// Takes the queued tombstones removed at or before `horizon`.
    fn take_expired(&mut self, horizon: Option<CommitId>) -> Vec<(CommitId, RowId)> {
        let expired = match horizon {
            Some(h) => {
                let later = self.tombstones.split_off(&h.next());
                std::mem::replace(&mut self.tombstones, later)
            }
            None => std::mem::take(&mut self.tombstones),
        };
        expired
            .into_iter()
            .flat_map(|(at, ids)| ids.into_iter().map(move |id| (at, id)))
            .collect()
    }

    /// Drops an entry, keeping the tombstone count in step.
    fn forget(&mut self, id: RowId) -> Option<RowEntry> {
        let entry = self.entries.remove(&id)?;
        if entry.removed_at.is_some() {
            self.tombstoned -= 1;
        }
        Some(entry)
    }
}

/// Counters returned by garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeStats {
    /// Tombstoned rows whose blocks were freed.
    pub rows: usize,
    /// Index blocks returned to the block store.
    pub index_blocks: usize,
}

impl PurgeStats {
    pub(crate) fn add(&mut self, other: Self) {
        self.rows += other.rows;
        self.index_blocks += other.index_blocks;
    }
}

/// Row and index blocks a commit wrote for one table, not yet visible.
#[derive(Debug)]
pub(crate) struct StagedTable {
    /// Holds the baseline chains alive until publish swaps them out.
    baseline: SnapshotIndexSet,
    indexes: StagedIndexSet,
    added: Vec<(RowId, Arc<Row>, BlockId)>,
    removed: Vec<RowId>,
    schema: Option<TableSchema>,
}

/// Resolves rows against a commit's pending rows, then committed rows.
struct StagingSource<'a> {
    pending: &'a HashMap<RowId, Arc<Row>>,
    rows: &'a RowSet,
}

impl RowSource for StagingSource<'_> {
    fn fetch(&self, id: RowId) -> Option<Arc<Row>> {
        self.pending
            .get(&id)
            .or_else(|| self.rows.entries.get(&id).map(|e| &e.row))
            .cloned()
    }
}

/// The committed state of one table.
///
/// Owns one block per committed row and the table's [`IndexSetStore`].
/// Shared by every transaction that can see the table, but mutated only by
/// the commit path and garbage collection while the conglomerate's commit
/// mutex is held. Removed rows stay readable as tombstones until no open
/// transaction can see them.
pub struct MasterTableSource {
    id: TableId,
    schema: RwLock<TableSchema>,
    index_columns: Vec<usize>,
    block_size: usize,
    store: SharedBlockStore,
    indexes: Arc<IndexSetStore>,
    rows: RwLock<RowSet>,
    next_row: AtomicU64,
}

impl MasterTableSource {
    pub(crate) fn new(id: TableId, schema: TableSchema, store: SharedBlockStore) -> Self {
        let index_columns = schema.indexed_columns();
        let block_size = store.read().block_size();
        let indexes = Arc::new(IndexSetStore::new(
            id,
            index_columns.len() + 1,
            Arc::clone(&store),
        ));
        Self {
            id,
            schema: RwLock::new(schema),
            index_columns,
            block_size,
            store,
            indexes,
            rows: RwLock::new(RowSet::default()),
            next_row: AtomicU64::new(1),
        }
    }

    /// Returns the table id.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> String {
        self.schema.read().name.clone()
    }

    /// Returns the committed schema.
    #[must_use]
    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    /// Positions of indexed columns in slot order.
    #[must_use]
    pub fn index_columns(&self) -> &[usize] {
        &self.index_columns
    }

    /// Returns the table's index block store.
    #[must_use]
    pub fn indexes(&self) -> &Arc<IndexSetStore> {
        &self.indexes
    }

    /// Block size rows must fit into.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn reserve_row_id(&self) -> RowId {
        RowId::new(self.next_row.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn create_index_set(&self) -> CoreResult<SnapshotIndexSet> {
        self.indexes.create_index_set()
    }

    /// Returns a committed row, tombstoned or not.
    #[must_use]
    pub fn row(&self, id: RowId) -> Option<Arc<Row>> {
        self.rows.read().entries.get(&id).map(|e| Arc::clone(&e.row))
    }

    /// Returns the commit that removed a row, if it was removed.
    #[must_use]
    pub fn removed_at(&self, id: RowId) -> Option<CommitId> {
        self.rows.read().entries.get(&id).and_then(|e| e.removed_at)
    }

    /// Number of committed rows not tombstoned.
    #[must_use]
    pub fn live_row_count(&self) -> usize {
        let rows = self.rows.read();
        rows.entries.len() - rows.tombstoned
    }

    /// Number of tombstoned rows awaiting garbage collection.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.rows.read().tombstoned
    }

    /// Applies a transaction's net changes to the latest committed state
    /// and writes the resulting blocks, without making anything visible.
    ///
    /// `schema` carries the transaction's altered schema when its
    /// constraints changed.
    pub(crate) fn stage(
        &self,
        changes: &TableChanges,
        pending: &HashMap<RowId, Arc<Row>>,
        schema: Option<&TableSchema>,
    ) -> CoreResult<StagedTable> {
        let rows = self.rows.read();
        let source = StagingSource {
            pending,
            rows: &*rows,
        };
        let schema = schema.cloned();
        let mut baseline = self.indexes.create_index_set()?;

        if let Some(id) = index::remove_rows(&mut baseline, &changes.removed) {
            return Err(CoreError::conflict(self.id, ConflictKind::RowRemoved(id)));
        }

        let mut added = Vec::with_capacity(changes.added.len());
        for &id in &changes.added {
            let row = pending.get(&id).ok_or_else(|| {
                CoreError::invalid_operation(format!("{id} of {} has no pending contents", self.id))
            })?;
            index::insert_row(&mut baseline, &self.index_columns, id, row, &source)?;
            added.push((id, Arc::clone(row)));
        }

        {
            let committed = self.schema.read();
            let effective = schema.as_ref().unwrap_or(&*committed);
            self.check_unique(&baseline, effective, changes, &source)?;
        }

        let mut written: Vec<(RowId, Arc<Row>, BlockId)> = Vec::with_capacity(added.len());
        for (id, row) in added {
            match self.write_row(id, &row) {
                Ok(block) => written.push((id, row, block)),
                Err(err) => {
                    self.free_row_blocks(written.iter().map(|(_, _, b)| *b));
                    return Err(err);
                }
            }
        }

        let indexes = match self.indexes.stage(&baseline) {
            Ok(indexes) => indexes,
            Err(err) => {
                self.free_row_blocks(written.iter().map(|(_, _, b)| *b));
                return Err(err);
            }
        };

        trace!(
            table = %self.id,
            added = written.len(),
            removed = changes.removed.len(),
            "staged table changes"
        );

        Ok(StagedTable {
            baseline,
            indexes,
            added: written,
            removed: changes.removed.iter().copied().collect(),
            schema,
        })
    }

    fn check_unique(
        &self,
        set: &SnapshotIndexSet,
        schema: &TableSchema,
        changes: &TableChanges,
        source: &dyn RowSource,
    ) -> CoreResult<()> {
        for (k, &column) in self.index_columns.iter().enumerate() {
            let Some(def) = schema.columns.get(column) else {
                continue;
            };
            if !def.unique {
                continue;
            }
            let slot = k + 1;
            let violation = |row| {
                CoreError::conflict(
                    self.id,
                    ConflictKind::UniqueViolation {
                        column: def.name.clone(),
                        row,
                    },
                )
            };

            if changes.constraints_altered {
                if let Some(row) = index::find_duplicate(set, slot, column, source)? {
                    return Err(violation(row));
                }
                continue;
            }
            for &id in &changes.added {
                let Some(row) = source.fetch(id) else { continue };
                let key = row.cell(column).unwrap_or_default();
                let matches = index::lookup(set, slot, column, key, source)?;
                if let Some(&other) = matches.iter().find(|&&r| r != id) {
                    return Err(violation(other));
                }
            }
        }
        Ok(())
    }

    fn write_row(&self, id: RowId, row: &Row) -> CoreResult<BlockId> {
        let encoded = row.encode(id);
        if encoded.len() > self.block_size {
            return Err(CoreError::RowTooLarge {
                len: encoded.len(),
                block_size: self.block_size,
            });
        }
        let mut store = self.store.write();
        let block = store.allocate()?;
        if let Err(err) = store.write_block(block, &encoded) {
            drop(store);
            self.free_row_blocks([block]);
            return Err(err.into());
        }
        Ok(block)
    }

    fn free_row_blocks(&self, blocks: impl IntoIterator<Item = BlockId>) {
        let mut store = self.store.write();
        for block in blocks {
            if let Err(err) = store.free(block) {
                warn!(table = %self.id, %block, error = %err, "failed to free row block");
            }
        }
    }

    /// Makes staged changes visible. Cannot fail.
    pub(crate) fn publish(&self, staged: StagedTable, commit: CommitId) {
        let StagedTable {
            baseline,
            indexes,
            added,
            removed,
            schema,
        } = staged;

        {
            let mut rows = self.rows.write();
            for (id, row, block) in added {
                rows.entries.insert(
                    id,
                    RowEntry {
                        row,
                        block,
                        removed_at: None,
                    },
                );
            }
            for id in removed {
                rows.tombstone(id, commit);
            }
        }

        self.indexes.publish(indexes);
        if let Some(schema) = schema {
            *self.schema.write() = schema;
        }
        drop(baseline);
    }

    /// Frees everything a staging run wrote.
    pub(crate) fn abandon(&self, staged: StagedTable) {
        self.free_row_blocks(staged.added.iter().map(|(_, _, b)| *b));
        self.indexes.abandon(staged.indexes);
    }

    /// Frees tombstoned rows no snapshot can see any more, then reclaims
    /// unreferenced index blocks.
    ///
    /// Rows removed at or before `horizon` are purged; `None` purges every
    /// tombstone. Only expired tombstones are visited. Rows whose block
    /// could not be freed stay queued for the next call.
    pub(crate) fn purge(&self, horizon: Option<CommitId>) -> CoreResult<PurgeStats> {
        let mut stats = PurgeStats::default();
        {
            let mut guard = self.rows.write();
            let rows = &mut *guard;
            let expired = rows.take_expired(horizon);
            if !expired.is_empty() {
                let mut store = self.store.write();
                for (i, &(_, id)) in expired.iter().enumerate() {
                    let Some(block) = rows.entries.get(&id).map(|e| e.block) else {
                        continue;
                    };
                    if let Err(err) = store.free(block) {
                        for &(at, id) in &expired[i..] {
                            rows.tombstones.entry(at).or_default().push(id);
                        }
                        return Err(err.into());
                    }
                    rows.forget(id);
                    stats.rows += 1;
                }
            }
        }
        stats.index_blocks = self.indexes.reclaim()?;
        Ok(stats)
    }

    /// Frees every block of a dropped table.
    pub(crate) fn release_storage(&self) -> CoreResult<PurgeStats> {
        let mut stats = PurgeStats::default();
        {
            let mut rows = self.rows.write();
            let blocks: Vec<(RowId, BlockId)> =
                rows.entries.iter().map(|(id, e)| (*id, e.block)).collect();
            let mut store = self.store.write();
            for (id, block) in blocks {
                store.free(block)?;
                rows.forget(id);
                stats.rows += 1;
            }
            rows.tombstones.clear();
        }
        self.indexes.release_current();
        stats.index_blocks = self.indexes.reclaim()?;
        Ok(stats)
    }

    /// SHA-256 over the committed schema, live rows and index chains.
    ///
    /// Two tables with equal digests hold the same visible state. Row id
    /// reservations and tombstones awaiting collection are not included.
    #[must_use]
    pub fn state_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_u32().to_le_bytes());
        {
            let schema = self.schema.read();
            hasher.update(schema.name.as_bytes());
            for column in &schema.columns {
                hasher.update((column.name.len() as u32).to_le_bytes());
                hasher.update(column.name.as_bytes());
                hasher.update([u8::from(column.indexed), u8::from(column.unique)]);
            }
        }

        {
            let rows = self.rows.read();
            let mut live: Vec<(&RowId, &RowEntry)> = rows
                .entries
                .iter()
                .filter(|(_, e)| e.removed_at.is_none())
                .collect();
            live.sort_by_key(|(id, _)| **id);
            for (id, entry) in live {
                hasher.update(id.as_u64().to_le_bytes());
                for cell in entry.row.cells() {
                    hasher.update((cell.len() as u32).to_le_bytes());
                    hasher.update(cell);
                }
            }
        }

        self.indexes.digest_into(&mut hasher);
        hasher.finalize().into()
    }

    /// Re-reads every committed row and index block from the block store
    /// and compares it with memory.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error, or `BlockCorruption` /
    /// `IndexCorruption` when a persisted block differs.
    pub fn verify_persisted(&self) -> CoreResult<()> {
        {
            let rows = self.rows.read();
            let store = self.store.read();
            for (id, entry) in &rows.entries {
                let (stored_id, stored) = Row::decode(&store.read_block(entry.block)?)?;
                if stored_id != *id || stored != *entry.row {
                    return Err(CoreError::block_corruption(format!(
                        "{} block {} does not hold {id}",
                        self.id, entry.block
                    )));
                }
            }
        }
        self.indexes.verify_persisted()
    }
}

impl std::fmt::Debug for MasterTableSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterTableSource")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("live_rows", &self.live_row_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::small_store;
    use crate::schema::ColumnDef;
    use std::collections::BTreeSet;

    fn people(store: SharedBlockStore) -> MasterTableSource {
        let schema = TableSchema::new("people")
            .column(ColumnDef::new("email").unique())
            .column(ColumnDef::new("city").indexed());
        MasterTableSource::new(TableId::new(1), schema, store)
    }

    fn insert(master: &MasterTableSource, cells: &[&[&str]], commit: u64) -> Vec<RowId> {
        let mut pending = HashMap::new();
        let mut changes = TableChanges::default();
        for row in cells {
            let id = master.reserve_row_id();
            pending.insert(id, Arc::new(Row::from_strs(row)));
            changes.added.insert(id);
        }
        let staged = master.stage(&changes, &pending, None).unwrap();
        master.publish(staged, CommitId::new(commit));
        changes.added.into_iter().collect()
    }

    fn remove(master: &MasterTableSource, ids: &[RowId], commit: u64) {
        let changes = TableChanges {
            removed: ids.iter().copied().collect::<BTreeSet<_>>(),
            ..TableChanges::default()
        };
        let staged = master.stage(&changes, &HashMap::new(), None).unwrap();
        master.publish(staged, CommitId::new(commit));
    }

    #[test]
    fn publish_makes_rows_visible() {
        let master = people(small_store());
        let ids = insert(&master, &[&["a@x", "oslo"], &["b@x", "rome"]], 1);

        assert_eq!(master.live_row_count(), 2);
        assert_eq!(master.row(ids[0]).unwrap().cell(1), Some(&b"oslo"[..]));
        let snapshot = master.create_index_set().unwrap();
        assert_eq!(snapshot.row_count(), 2);
        master.verify_persisted().unwrap();
    }

    #[test]
    fn removal_tombstones_until_purged() {
        let store = small_store();
        let master = people(Arc::clone(&store));
        let ids = insert(&master, &[&["a@x", "oslo"], &["b@x", "rome"]], 1);

        remove(&master, &ids[..1], 2);
        assert_eq!(master.removed_at(ids[0]), Some(CommitId::new(2)));
        assert_eq!(master.live_row_count(), 1);
        assert_eq!(master.tombstone_count(), 1);

        assert_eq!(master.purge(Some(CommitId::new(1))).unwrap().rows, 0);
        let stats = master.purge(None).unwrap();
        assert_eq!(stats.rows, 1);
        assert!(master.row(ids[0]).is_none());
    }

    #[test]
    fn purge_frees_only_expired_tombstones() {
        let store = small_store();
        let master = people(Arc::clone(&store));
        let ids = insert(
            &master,
            &[&["a@x", "oslo"], &["b@x", "rome"], &["c@x", "lima"], &["d@x", "bern"]],
            1,
        );
        remove(&master, &ids[..1], 2);
        remove(&master, &ids[1..3], 3);
        assert_eq!(master.live_row_count(), 1);
        assert_eq!(master.tombstone_count(), 3);

        let stats = master.purge(Some(CommitId::new(2))).unwrap();
        assert_eq!(stats.rows, 1);
        assert!(master.row(ids[0]).is_none());
        assert!(master.row(ids[1]).is_some());
        assert_eq!(master.tombstone_count(), 2);

        assert_eq!(master.purge(Some(CommitId::new(2))).unwrap().rows, 0);
        assert_eq!(master.purge(Some(CommitId::new(3))).unwrap().rows, 2);
        assert_eq!(master.tombstone_count(), 0);
        assert_eq!(master.live_row_count(), 1);
        master.verify_persisted().unwrap();
    }

    #[test]
    fn unique_violation_is_a_conflict() {
        let store = small_store();
        let master = people(Arc::clone(&store));
        insert(&master, &[&["a@x", "oslo"]], 1);
        let live = store.read().live_blocks().unwrap();

        let id = master.reserve_row_id();
        let pending = HashMap::from([(id, Arc::new(Row::from_strs(&["a@x", "rome"])))]);
        let changes = TableChanges {
            added: BTreeSet::from([id]),
            ..TableChanges::default()
        };

        let err = master.stage(&changes, &pending, None).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::UniqueViolation { .. },
                ..
            }
        ));
        assert_eq!(store.read().live_blocks().unwrap(), live);
    }

    #[test]
    fn removing_a_gone_row_conflicts() {
        let master = people(small_store());
        let ids = insert(&master, &[&["a@x", "oslo"]], 1);
        remove(&master, &ids, 2);

        let changes = TableChanges {
            removed: BTreeSet::from([ids[0]]),
            ..TableChanges::default()
        };
        let err = master.stage(&changes, &HashMap::new(), None).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn abandon_restores_block_count_and_digest() {
        let store = small_store();
        let master = people(Arc::clone(&store));
        insert(&master, &[&["a@x", "oslo"]], 1);
        let live = store.read().live_blocks().unwrap();
        let digest = master.state_digest();

        let id = master.reserve_row_id();
        let pending = HashMap::from([(id, Arc::new(Row::from_strs(&["c@x", "bern"])))]);
        let changes = TableChanges {
            added: BTreeSet::from([id]),
            ..TableChanges::default()
        };
        let staged = master.stage(&changes, &pending, None).unwrap();
        master.abandon(staged);

        assert_eq!(store.read().live_blocks().unwrap(), live);
        assert_eq!(master.state_digest(), digest);
    }

    #[test]
    fn release_storage_frees_everything() {
        let store = small_store();
        let master = people(Arc::clone(&store));
        insert(&master, &[&["a@x", "oslo"], &["b@x", "rome"]], 1);

        master.release_storage().unwrap();
        assert_eq!(store.read().live_blocks().unwrap(), 0);
    }

    #[test]
    fn oversized_row_is_rejected() {
        let master = people(small_store());
        let id = master.reserve_row_id();
        let big = "x".repeat(100);
        let pending = HashMap::from([(id, Arc::new(Row::from_strs(&[big.as_str(), "oslo"])))]);
        let changes = TableChanges {
            added: BTreeSet::from([id]),
            ..TableChanges::default()
        };

        let err = master.stage(&changes, &pending, None).unwrap_err();
        assert!(matches!(err, CoreError::RowTooLarge { .. }));
    }
}
