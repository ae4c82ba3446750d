//! Reference-counted index block arena.

use crate::error::{CoreError, CoreResult};
use crate::index::block;
use crate::index::snapshot::{IndexView, SnapshotIndexSet};
use crate::types::{BlockId, RowId, SharedBlockStore, TableId};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug)]
struct BlockEntry {
    rows: Arc<[RowId]>,
    /// Current-chain membership counts as one reference.
    refs: usize,
}

#[derive(Debug, Default)]
struct ArenaState {
    blocks: HashMap<BlockId, BlockEntry>,
    /// Committed block chain of every index.
    current: Vec<Vec<BlockId>>,
    /// Blocks whose count reached zero, waiting for `reclaim`.
    reclaimable: Vec<BlockId>,
}

/// Counters describing an [`IndexSetStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    /// Blocks held in the arena, referenced or not.
    pub live_blocks: usize,
    /// Blocks with zero references not yet returned to the block store.
    pub reclaimable_blocks: usize,
    /// Sum of all reference counts.
    pub references: usize,
}

#[derive(Debug)]
struct StagedBlock {
    id: BlockId,
    rows: Arc<[RowId]>,
    /// Written by this staging run rather than reused from the current chain.
    fresh: bool,
}

/// Index chains written to the block store but not yet published.
#[derive(Debug)]
pub(crate) struct StagedIndexSet {
    chains: Vec<Option<Vec<StagedBlock>>>,
}

impl StagedIndexSet {
    fn fresh_blocks(&self) -> Vec<BlockId> {
        self.chains
            .iter()
            .flatten()
            .flatten()
            .filter(|b| b.fresh)
            .map(|b| b.id)
            .collect()
    }
}

/// Manages the persisted index blocks of one master table.
///
/// Blocks are immutable once published and live in an arena keyed by
/// [`BlockId`] with an explicit reference count. Each index's current
/// chain holds one reference per block and every [`SnapshotIndexSet`]
/// holds one more for as long as it lives. A block whose count drops to
/// zero becomes reclaimable; [`IndexSetStore::reclaim`] returns it to the
/// block store. Counts never go below zero.
pub struct IndexSetStore {
    table: TableId,
    capacity: usize,
    store: SharedBlockStore,
    state: Mutex<ArenaState>,
}

impl IndexSetStore {
    /// Creates a store with `index_count` empty indexes.
    pub(crate) fn new(table: TableId, index_count: usize, store: SharedBlockStore) -> Self {
        let capacity = block::capacity(store.read().block_size()).max(1);
        Self {
            table,
            capacity,
            store,
            state: Mutex::new(ArenaState {
                current: vec![Vec::new(); index_count],
                ..ArenaState::default()
            }),
        }
    }

    /// Returns the owning table.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }

    /// Number of indexes managed.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.state.lock().current.len()
    }

    /// Row ids per index block.
    #[must_use]
    pub fn block_capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a snapshot of every index as currently committed.
    ///
    /// Increments the reference count of every current block. Either all
    /// references are taken or, on error, none.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorruption` if a current chain names a block that is
    /// missing from the arena.
    pub fn create_index_set(self: &Arc<Self>) -> CoreResult<SnapshotIndexSet> {
        let mut state = self.state.lock();
        let mut views = Vec::with_capacity(state.current.len());
        let mut referenced = Vec::new();

        for chain in &state.current {
            let mut blocks = Vec::with_capacity(chain.len());
            for id in chain {
                let entry = state.blocks.get(id).ok_or_else(|| {
                    CoreError::index_corruption(format!("{} chain names missing {id}", self.table))
                })?;
                blocks.push(Arc::clone(&entry.rows));
                referenced.push(*id);
            }
            views.push(IndexView::Shared(blocks));
        }

        for id in &referenced {
            if let Some(entry) = state.blocks.get_mut(id) {
                entry.refs += 1;
            }
        }

        Ok(SnapshotIndexSet::new(Arc::clone(self), views, referenced))
    }

    /// Writes every privately modified index of `set` as new blocks.
    ///
    /// Leading blocks whose contents are unchanged are reused instead of
    /// rewritten. Nothing becomes visible until [`Self::publish`]. On error
    /// the blocks written so far are freed and the arena is untouched.
    pub(crate) fn stage(&self, set: &SnapshotIndexSet) -> CoreResult<StagedIndexSet> {
        let current: Vec<Vec<(BlockId, Arc<[RowId]>)>> = {
            let state = self.state.lock();
            state
                .current
                .iter()
                .map(|chain| {
                    chain
                        .iter()
                        .filter_map(|id| state.blocks.get(id).map(|e| (*id, Arc::clone(&e.rows))))
                        .collect()
                })
                .collect()
        };

        let mut written = Vec::new();
        let mut chains = Vec::with_capacity(current.len());
        for (slot, old) in current.iter().enumerate() {
            let Some(rows) = set.private_rows(slot) else {
                chains.push(None);
                continue;
            };
            match self.write_chain(rows, old, &mut written) {
                Ok(chain) => chains.push(Some(chain)),
                Err(err) => {
                    self.free_blocks(&written);
                    return Err(err);
                }
            }
        }

        trace!(table = %self.table, blocks = written.len(), "staged index blocks");
        Ok(StagedIndexSet { chains })
    }

    fn write_chain(
        &self,
        rows: &[RowId],
        old: &[(BlockId, Arc<[RowId]>)],
        written: &mut Vec<BlockId>,
    ) -> CoreResult<Vec<StagedBlock>> {
        let mut chain = Vec::with_capacity(rows.len() / self.capacity + 1);
        for (pos, chunk) in rows.chunks(self.capacity).enumerate() {
            if let Some((id, existing)) = old.get(pos) {
                if existing.as_ref() == chunk {
                    chain.push(StagedBlock {
                        id: *id,
                        rows: Arc::clone(existing),
                        fresh: false,
                    });
                    continue;
                }
            }

            let mut store = self.store.write();
            let id = store.allocate()?;
            written.push(id);
            store.write_block(id, &block::encode(chunk))?;
            chain.push(StagedBlock {
                id,
                rows: Arc::from(chunk),
                fresh: true,
            });
        }
        Ok(chain)
    }

    /// Makes staged chains current. Cannot fail.
    pub(crate) fn publish(&self, staged: StagedIndexSet) {
        let mut state = self.state.lock();
        for (slot, chain) in staged.chains.into_iter().enumerate() {
            let Some(chain) = chain else { continue };
            let mut ids = Vec::with_capacity(chain.len());
            for block in chain {
                state
                    .blocks
                    .entry(block.id)
                    .or_insert_with(|| BlockEntry {
                        rows: block.rows,
                        refs: 0,
                    })
                    .refs += 1;
                ids.push(block.id);
            }
            let old = std::mem::replace(&mut state.current[slot], ids);
            Self::release_locked(&mut state, self.table, &old);
        }
    }

    /// Frees the blocks a failed commit wrote.
    pub(crate) fn abandon(&self, staged: StagedIndexSet) {
        self.free_blocks(&staged.fresh_blocks());
    }

    /// Drops one reference from each block.
    pub(crate) fn release(&self, blocks: &[BlockId]) {
        let mut state = self.state.lock();
        Self::release_locked(&mut state, self.table, blocks);
    }

    /// Drops the current chains' references, used when the table is gone.
    pub(crate) fn release_current(&self) {
        let mut state = self.state.lock();
        let chains = std::mem::take(&mut state.current);
        for chain in &chains {
            Self::release_locked(&mut state, self.table, chain);
        }
    }

    fn release_locked(state: &mut ArenaState, table: TableId, blocks: &[BlockId]) {
        for id in blocks {
            match state.blocks.get_mut(id) {
                Some(entry) if entry.refs > 0 => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        state.reclaimable.push(*id);
                    }
                }
                Some(_) => warn!(%table, block = %id, "release of unreferenced index block ignored"),
                None => warn!(%table, block = %id, "release of unknown index block ignored"),
            }
        }
    }

    /// Returns zero-reference blocks to the block store.
    ///
    /// Returns the number of blocks freed. On a store error the blocks not
    /// yet freed stay reclaimable for the next call.
    ///
    /// # Errors
    ///
    /// Returns the first block store error.
    pub fn reclaim(&self) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.reclaimable);
        let mut store = self.store.write();
        let mut freed = 0;

        for (i, id) in pending.iter().enumerate() {
            if !matches!(state.blocks.get(id), Some(entry) if entry.refs == 0) {
                continue;
            }
            if let Err(err) = store.free(*id) {
                state.reclaimable.extend_from_slice(&pending[i..]);
                return Err(err.into());
            }
            state.blocks.remove(id);
            freed += 1;
        }
        Ok(freed)
    }

    fn free_blocks(&self, blocks: &[BlockId]) {
        let mut store = self.store.write();
        for id in blocks {
            if let Err(err) = store.free(*id) {
                warn!(table = %self.table, block = %id, error = %err, "failed to free staged index block");
            }
        }
    }

    /// Returns arena counters.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let state = self.state.lock();
        IndexStats {
            live_blocks: state.blocks.len(),
            reclaimable_blocks: state.reclaimable.len(),
            references: state.blocks.values().map(|e| e.refs).sum(),
        }
    }

    /// Returns a block's reference count, if it is still in the arena.
    #[must_use]
    pub fn ref_count(&self, id: BlockId) -> Option<usize> {
        self.state.lock().blocks.get(&id).map(|e| e.refs)
    }

    /// Returns the committed block chain of one index.
    #[must_use]
    pub fn current_chain(&self, index: usize) -> Vec<BlockId> {
        self.state
            .lock()
            .current
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-reads every current block from the block store and compares it
    /// with the arena.
    ///
    /// # Errors
    ///
    /// Returns a storage or decoding error, or `IndexCorruption` when the
    /// persisted contents differ from memory.
    pub fn verify_persisted(&self) -> CoreResult<()> {
        let state = self.state.lock();
        let store = self.store.read();
        for id in state.current.iter().flatten() {
            let on_disk = block::decode(&store.read_block(*id)?)?;
            let in_memory = state
                .blocks
                .get(id)
                .ok_or_else(|| CoreError::index_corruption(format!("missing {id}")))?;
            if on_disk.as_slice() != in_memory.rows.as_ref() {
                return Err(CoreError::index_corruption(format!(
                    "{} block {id} differs from its persisted copy",
                    self.table
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        let state = self.state.lock();
        for (slot, chain) in state.current.iter().enumerate() {
            hasher.update((slot as u32).to_le_bytes());
            for id in chain {
                if let Some(entry) = state.blocks.get(id) {
                    for row in entry.rows.iter() {
                        hasher.update(row.as_u64().to_le_bytes());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSetStore")
            .field("table", &self.table)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::small_store;

    fn fill(set: &mut SnapshotIndexSet, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            let pos = set.len(0);
            set.insert_at(0, pos, RowId::new(id));
        }
    }

    fn commit(store: &Arc<IndexSetStore>, set: &SnapshotIndexSet) {
        let staged = store.stage(set).unwrap();
        store.publish(staged);
    }

    #[test]
    fn snapshot_takes_and_releases_references() {
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 1, small_store()));
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 1..=10);
        commit(&store, &writer);
        drop(writer);

        let chain = store.current_chain(0);
        assert_eq!(chain.len(), 2);
        assert!(chain.iter().all(|b| store.ref_count(*b) == Some(1)));

        let mut reader = store.create_index_set().unwrap();
        assert!(chain.iter().all(|b| store.ref_count(*b) == Some(2)));
        assert_eq!(reader.row_count(), 10);

        reader.dispose();
        reader.dispose();
        assert!(chain.iter().all(|b| store.ref_count(*b) == Some(1)));
    }

    #[test]
    fn unchanged_leading_blocks_are_shared() {
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 1, small_store()));
        let mut first = store.create_index_set().unwrap();
        fill(&mut first, 1..=8);
        commit(&store, &first);
        drop(first);
        let before = store.current_chain(0);

        let mut second = store.create_index_set().unwrap();
        fill(&mut second, 9..=9);
        commit(&store, &second);
        drop(second);
        let after = store.current_chain(0);

        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert_eq!(store.ref_count(before[1]), Some(0));
        assert_eq!(store.stats().reclaimable_blocks, 1);
    }

    #[test]
    fn reader_keeps_old_chain_alive() {
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 1, small_store()));
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 1..=3);
        commit(&store, &writer);
        drop(writer);
        let old = store.current_chain(0);

        let reader = store.create_index_set().unwrap();
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 4..=4);
        commit(&store, &writer);
        drop(writer);

        assert_eq!(store.ref_count(old[0]), Some(1));
        assert_eq!(store.reclaim().unwrap(), 0);
        assert_eq!(reader.iter(0).count(), 3);

        drop(reader);
        assert_eq!(store.reclaim().unwrap(), 1);
        assert_eq!(store.ref_count(old[0]), None);
    }

    #[test]
    fn release_never_goes_negative() {
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 1, small_store()));
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 1..=2);
        commit(&store, &writer);
        drop(writer);
        let chain = store.current_chain(0);

        store.release(&chain);
        store.release(&chain);
        assert_eq!(store.ref_count(chain[0]), Some(0));
        assert_eq!(store.stats().references, 0);
    }

    #[test]
    fn abandon_frees_fresh_blocks_only() {
        let blocks = small_store();
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 1, Arc::clone(&blocks)));
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 1..=6);
        commit(&store, &writer);
        drop(writer);
        let live = blocks.read().live_blocks().unwrap();

        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 7..=7);
        let staged = store.stage(&writer).unwrap();
        assert_eq!(blocks.read().live_blocks().unwrap(), live + 1);
        store.abandon(staged);

        assert_eq!(blocks.read().live_blocks().unwrap(), live);
        assert_eq!(store.current_chain(0).len(), 1);
    }

    #[test]
    fn persisted_blocks_match_memory() {
        let store = Arc::new(IndexSetStore::new(TableId::new(1), 2, small_store()));
        let mut writer = store.create_index_set().unwrap();
        fill(&mut writer, 1..=20);
        commit(&store, &writer);
        drop(writer);

        store.verify_persisted().unwrap();
        assert_eq!(store.stats().live_blocks, 4);
    }
}
