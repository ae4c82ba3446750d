//! The conglomerate: every table of a database plus the machinery that
//! gives concurrent transactions consistent views of them.

mod collector;
mod conflict;
mod open_list;

use crate::config::{CleanupMode, Config, TransactionOptions, MIN_BLOCK_SIZE};
use crate::error::{ConflictKind, CoreError, CoreResult};
use crate::locker::Locker;
use crate::table::{MasterTableSource, PurgeStats, StagedTable};
use crate::transaction::{TableChanges, TableView, Transaction};
use crate::types::{share_store, CommitId, SharedBlockStore, TableId, TransactionId};
use collector::Collector;
use conflict::CommitRecord;
use open_list::OpenTransactionList;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_storage::{BlockStore, FileBlockStore, InMemoryBlockStore};
use tracing::{debug, info, warn};

/// What one garbage collection pass reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    /// Tombstoned rows freed.
    pub rows_purged: usize,
    /// Index blocks returned to the block store.
    pub index_blocks_reclaimed: usize,
    /// Dropped tables whose storage was released.
    pub tables_released: usize,
}

/// State guarded by the commit mutex.
#[derive(Debug)]
struct CommitState {
    commit_id: CommitId,
    tables: BTreeMap<TableId, Arc<MasterTableSource>>,
    open: OpenTransactionList,
    /// Records still needed to validate some open transaction.
    history: Vec<CommitRecord>,
    /// Dropped tables with the commit that dropped them.
    retired: Vec<(CommitId, Arc<MasterTableSource>)>,
}

impl CommitState {
    /// Removes a transaction from the open list and advances the commit id.
    /// Returns true when no transaction remains open.
    fn close(&mut self, id: TransactionId) -> bool {
        if !self.open.remove(id) {
            warn!(txn = %id, "closed transaction was not in the open list");
        }
        self.commit_id = self.commit_id.next();
        match self.open.min_start() {
            Some(min) => self.history.retain(|r| r.commit > min),
            None => self.history.clear(),
        }
        self.open.is_empty()
    }
}

/// Internals shared by the conglomerate handle and every transaction.
pub(crate) struct Shared {
    config: Config,
    store: SharedBlockStore,
    locker: Locker,
    next_table: AtomicU32,
    next_txn: AtomicU64,
    state: Mutex<CommitState>,
    /// Present in `CleanupMode::Background`.
    collector: Option<Collector>,
}

impl Shared {
    pub(crate) fn store(&self) -> SharedBlockStore {
        Arc::clone(&self.store)
    }

    pub(crate) fn locker(&self) -> &Locker {
        &self.locker
    }

    pub(crate) fn allocate_table_id(&self) -> TableId {
        TableId::new(self.next_table.fetch_add(1, Ordering::Relaxed))
    }

    /// Validates, stages and publishes a transaction's changes, then
    /// closes it. Returns the commit id and whether the open list is now
    /// empty.
    ///
    /// On error nothing was published and the transaction is still open.
    pub(crate) fn commit(&self, txn: &mut Transaction) -> CoreResult<(CommitId, bool)> {
        let changes = txn.journal.normalize();
        let selected: Vec<TableId> = txn
            .views
            .iter()
            .filter(|(_, v)| v.selected.get())
            .map(|(id, _)| *id)
            .collect();
        let start = txn.start_commit_id();

        let mut state = self.state.lock();
        conflict::validate(
            &changes,
            &selected,
            txn.options().dirty_select,
            state.history.iter().filter(|r| r.commit > start),
        )?;
        self.check_names(&state, &changes, &txn.views)?;

        let commit = state.commit_id.next();
        let staged = self.stage_all(&changes, &txn.views)?;
        let flushed = self.store.write().flush();
        if let Err(err) = flushed {
            Self::abandon_all(staged);
            return Err(err.into());
        }

        for (master, table) in staged {
            master.publish(table, commit);
        }
        for (&table, change) in &changes {
            if change.created {
                if let Some(view) = txn.views.get(&table) {
                    state.tables.insert(table, Arc::clone(&view.master));
                }
            }
            if change.dropped {
                if let Some(master) = state.tables.remove(&table) {
                    state.retired.push((commit, master));
                }
            }
        }

        if !changes.is_empty() {
            state.history.push(CommitRecord {
                commit,
                tables: changes,
            });
        }
        let idle = state.close(txn.id());
        debug!(txn = %txn.id(), %commit, "transaction committed");
        Ok((commit, idle))
    }

    fn check_names(
        &self,
        state: &CommitState,
        changes: &BTreeMap<TableId, TableChanges>,
        views: &BTreeMap<TableId, TableView>,
    ) -> CoreResult<()> {
        for (&table, change) in changes.iter().filter(|(_, c)| c.created) {
            let Some(view) = views.get(&table) else {
                continue;
            };
            let name = &view.schema.name;
            let taken = state.tables.iter().any(|(id, m)| {
                !changes.get(id).is_some_and(|c| c.dropped) && m.name() == *name
            });
            if taken {
                warn!(%table, name = %name, "table name taken concurrently");
                return Err(CoreError::conflict(
                    table,
                    ConflictKind::TableNameClash(name.clone()),
                ));
            }
        }
        Ok(())
    }

    /// Stages every changed table. On error the tables staged so far are
    /// abandoned.
    fn stage_all(
        &self,
        changes: &BTreeMap<TableId, TableChanges>,
        views: &BTreeMap<TableId, TableView>,
    ) -> CoreResult<Vec<(Arc<MasterTableSource>, StagedTable)>> {
        let mut staged = Vec::new();
        for (&table, change) in changes {
            if change.dropped || !(change.has_row_changes() || change.constraints_altered) {
                continue;
            }
            let result = views
                .get(&table)
                .ok_or_else(|| CoreError::TableNotFound(table.to_string()))
                .and_then(|view| {
                    let schema = change.constraints_altered.then_some(&view.schema);
                    view.master
                        .stage(change, &view.pending, schema)
                        .map(|s| (Arc::clone(&view.master), s))
                });
            match result {
                Ok(entry) => staged.push(entry),
                Err(err) => {
                    Self::abandon_all(staged);
                    return Err(err);
                }
            }
        }
        Ok(staged)
    }

    fn abandon_all(staged: Vec<(Arc<MasterTableSource>, StagedTable)>) {
        for (master, table) in staged {
            master.abandon(table);
        }
    }

    /// Closes a transaction without publishing anything.
    pub(crate) fn close(&self, id: TransactionId) -> bool {
        let idle = self.state.lock().close(id);
        debug!(txn = %id, "transaction rolled back");
        idle
    }

    /// Runs after a close left no transaction open.
    pub(crate) fn on_idle(&self) {
        match self.config.cleanup {
            CleanupMode::Inline => self.collect_inline(),
            CleanupMode::Background => {
                if !self.collector.as_ref().is_some_and(Collector::request) {
                    self.collect_inline();
                }
            }
            CleanupMode::Manual => {}
        }
    }

    fn collect_inline(&self) {
        if let Err(err) = self.collect_garbage() {
            warn!(error = %err, "garbage collection failed");
        }
    }

    /// Reclaims rows and blocks no open transaction can see.
    pub(crate) fn collect_garbage(&self) -> CoreResult<GcStats> {
        let mut state = self.state.lock();
        let horizon = state.open.min_start();
        let mut purged = PurgeStats::default();

        for master in state.tables.values() {
            purged.add(master.purge(horizon)?);
        }

        let mut tables_released = 0;
        let retired = std::mem::take(&mut state.retired);
        let mut failure = None;
        for (dropped_at, master) in retired {
            let expired = horizon.map_or(true, |h| dropped_at <= h);
            if !expired || failure.is_some() {
                state.retired.push((dropped_at, master));
                continue;
            }
            match master.release_storage() {
                Ok(stats) => {
                    purged.add(stats);
                    tables_released += 1;
                }
                Err(err) => {
                    failure = Some(err);
                    state.retired.push((dropped_at, master));
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let stats = GcStats {
            rows_purged: purged.rows,
            index_blocks_reclaimed: purged.index_blocks,
            tables_released,
        };
        debug!(?horizon, ?stats, "garbage collected");
        Ok(stats)
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("locker", &self.locker)
            .field("state", &self.state)
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}

/// The set of tables of one database and the transactions working on it.
///
/// Cheap to clone; every clone refers to the same tables.
///
/// # Example
///
/// ```
/// use tessera_core::{ColumnDef, Conglomerate, Row, TableSchema};
///
/// let db = Conglomerate::in_memory();
/// let table = db
///     .transaction(|txn| {
///         let table = txn.create_table(TableSchema::new("people").column(ColumnDef::new("name")))?;
///         txn.insert_row(table, Row::from_strs(&["alice"]))?;
///         Ok(table)
///     })
///     .unwrap();
///
/// let txn = db.create_transaction().unwrap();
/// assert_eq!(txn.row_count(table).unwrap(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Conglomerate {
    shared: Arc<Shared>,
}

impl Conglomerate {
    /// Creates a conglomerate over a block store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the store's block size is below
    /// [`MIN_BLOCK_SIZE`].
    pub fn new(config: Config, store: Box<dyn BlockStore>) -> CoreResult<Self> {
        let block_size = store.block_size();
        if block_size < MIN_BLOCK_SIZE {
            return Err(CoreError::invalid_operation(format!(
                "block size {block_size} is below the minimum of {MIN_BLOCK_SIZE}"
            )));
        }
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: Config, store: Box<dyn BlockStore>) -> Self {
        info!(block_size = store.block_size(), cleanup = ?config.cleanup, "conglomerate opened");
        let locker = Locker::new(config.lock_timeout);
        let store = share_store(store);
        Self {
            shared: Arc::new_cyclic(|weak| Shared {
                collector: (config.cleanup == CleanupMode::Background)
                    .then(|| Collector::start(weak.clone())),
                config,
                store,
                locker,
                next_table: AtomicU32::new(1),
                next_txn: AtomicU64::new(1),
                state: Mutex::new(CommitState {
                    commit_id: CommitId::new(0),
                    tables: BTreeMap::new(),
                    open: OpenTransactionList::default(),
                    history: Vec::new(),
                    retired: Vec::new(),
                }),
            }),
        }
    }

    /// Creates an in-memory conglomerate with default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_store(Config::default(), Box::new(InMemoryBlockStore::new()))
    }

    /// Creates an in-memory conglomerate with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `config.block_size` is too small.
    pub fn in_memory_with(config: Config) -> CoreResult<Self> {
        let store = InMemoryBlockStore::with_block_size(config.block_size);
        Self::new(config, Box::new(store))
    }

    /// Creates a conglomerate over a block file.
    ///
    /// The file only provides block space; table metadata is owned by the
    /// catalog, so a reopened file starts with no tables.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened or is locked
    /// by another process.
    pub fn open_file(path: &Path, config: Config) -> CoreResult<Self> {
        let store = FileBlockStore::open_with_create_dirs(path, config.block_size)?;
        Self::new(config, Box::new(store))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Starts a transaction with the configured default options.
    ///
    /// # Errors
    ///
    /// Returns `IndexCorruption` if a table's index snapshot cannot be
    /// taken. Nothing is registered in that case.
    pub fn create_transaction(&self) -> CoreResult<Transaction> {
        let options = TransactionOptions::new().dirty_select(self.shared.config.dirty_select);
        self.create_transaction_with(options)
    }

    /// Starts a transaction with explicit options.
    ///
    /// Taking the snapshot is atomic with respect to commits.
    ///
    /// # Errors
    ///
    /// As [`Conglomerate::create_transaction`].
    pub fn create_transaction_with(&self, options: TransactionOptions) -> CoreResult<Transaction> {
        let mut state = self.shared.state.lock();
        let start = state.commit_id;

        let mut views = BTreeMap::new();
        for (&id, master) in &state.tables {
            let indexes = master.create_index_set()?;
            views.insert(id, TableView::new(Arc::clone(master), indexes, false));
        }

        let id = TransactionId::new(self.shared.next_txn.fetch_add(1, Ordering::Relaxed));
        state.open.insert(id, start);
        drop(state);

        debug!(txn = %id, %start, tables = views.len(), "transaction opened");
        Ok(Transaction::new(
            id,
            start,
            options,
            Arc::clone(&self.shared),
            views,
        ))
    }

    /// Runs `f` in a new transaction, committing on `Ok` and rolling back
    /// on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error or the commit error. A failed commit is
    /// rolled back.
    pub fn transaction<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<R>,
    {
        let mut txn = self.create_transaction()?;
        match f(&mut txn) {
            Ok(result) => match txn.commit() {
                Ok(_) => Ok(result),
                Err(err) => {
                    txn.rollback()?;
                    Err(err)
                }
            },
            Err(err) => {
                txn.rollback()?;
                Err(err)
            }
        }
    }

    /// Returns the current commit id.
    #[must_use]
    pub fn commit_id(&self) -> CommitId {
        self.shared.state.lock().commit_id
    }

    /// Number of transactions not yet closed.
    #[must_use]
    pub fn open_transaction_count(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    /// Names of the committed tables, in table id order.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .tables
            .values()
            .map(|m| m.name())
            .collect()
    }

    /// Returns a committed table.
    #[must_use]
    pub fn table(&self, id: TableId) -> Option<Arc<MasterTableSource>> {
        self.shared.state.lock().tables.get(&id).cloned()
    }

    /// Returns a committed table by name.
    #[must_use]
    pub fn table_by_name(&self, name: &str) -> Option<Arc<MasterTableSource>> {
        self.shared
            .state
            .lock()
            .tables
            .values()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Returns the table locker.
    #[must_use]
    pub fn locker(&self) -> &Locker {
        &self.shared.locker
    }

    /// Number of blocks allocated in the block store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn live_blocks(&self) -> CoreResult<u64> {
        Ok(self.shared.store.read().live_blocks()?)
    }

    /// Reclaims tombstoned rows, unreferenced index blocks and dropped
    /// tables that no open transaction can see.
    ///
    /// # Errors
    ///
    /// Returns the first block store error; whatever was not reclaimed is
    /// retried by the next collection.
    pub fn collect_garbage(&self) -> CoreResult<GcStats> {
        self.shared.collect_garbage()
    }

    /// Flushes and syncs the block store.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn sync(&self) -> CoreResult<()> {
        let mut store = self.shared.store.write();
        store.flush()?;
        store.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::table::Row;
    use crate::types::RowId;
    use std::time::Duration;

    fn people() -> TableSchema {
        TableSchema::new("people")
            .column(ColumnDef::new("name").unique())
            .column(ColumnDef::new("city").indexed())
    }

    fn inline() -> Conglomerate {
        Conglomerate::in_memory_with(Config::new().cleanup(CleanupMode::Inline)).unwrap()
    }

    fn seeded(names: &[&str]) -> (Conglomerate, TableId, Vec<RowId>) {
        let db = inline();
        let (table, ids) = db
            .transaction(|txn| {
                let table = txn.create_table(people())?;
                let mut ids = Vec::new();
                for name in names {
                    ids.push(txn.insert_row(table, Row::from_strs(&[name, "oslo"]))?);
                }
                Ok((table, ids))
            })
            .unwrap();
        (db, table, ids)
    }

    fn visible(txn: &Transaction, table: TableId) -> Vec<RowId> {
        txn.row_ids(table).unwrap().collect()
    }

    #[test]
    fn commit_and_rollback_both_advance_commit_id() {
        let db = Conglomerate::in_memory();
        assert_eq!(db.commit_id(), CommitId::new(0));

        let mut txn = db.create_transaction().unwrap();
        assert_eq!(db.open_transaction_count(), 1);
        txn.rollback().unwrap();
        assert_eq!(db.commit_id(), CommitId::new(1));

        let mut txn = db.create_transaction().unwrap();
        assert_eq!(txn.commit().unwrap(), CommitId::new(2));
        assert_eq!(db.commit_id(), CommitId::new(2));
        assert_eq!(db.open_transaction_count(), 0);
    }

    #[test]
    fn snapshot_does_not_see_later_commits() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        let reader = db.create_transaction().unwrap();

        db.transaction(|txn| {
            txn.insert_row(table, Row::from_strs(&["cid", "rome"]))?;
            txn.remove_row(table, ids[0])
        })
        .unwrap();

        assert_eq!(visible(&reader, table), ids);
        assert_eq!(reader.get_row(table, ids[0]).unwrap().cell(0), Some(&b"ann"[..]));

        let fresh = db.create_transaction().unwrap();
        assert_eq!(fresh.row_count(table).unwrap(), 2);
        assert!(fresh.get_row(table, ids[0]).is_err());
    }

    #[test]
    fn concurrent_removal_of_same_row_conflicts() {
        let (db, table, ids) = seeded(&["one", "two", "three"]);
        let mut t1 = db.create_transaction().unwrap();
        let mut t2 = db.create_transaction().unwrap();

        t1.remove_row(table, ids[1]).unwrap();
        t1.commit().unwrap();

        t2.remove_row(table, ids[1]).unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::RowRemoved(_),
                ..
            }
        ));
        assert!(t2.is_open());
        t2.rollback().unwrap();

        let t3 = db.create_transaction().unwrap();
        assert_eq!(visible(&t3, table), vec![ids[0], ids[2]]);
    }

    #[test]
    fn disjoint_commits_merge() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        let mut t1 = db.create_transaction().unwrap();
        let mut t2 = db.create_transaction().unwrap();

        t1.remove_row(table, ids[0]).unwrap();
        let added = t2.insert_row(table, Row::from_strs(&["cid", "lima"])).unwrap();
        t2.remove_row(table, ids[1]).unwrap();
        t1.commit().unwrap();
        t2.commit().unwrap();

        let t3 = db.create_transaction().unwrap();
        assert_eq!(visible(&t3, table), vec![added]);
        assert_eq!(db.table(table).unwrap().live_row_count(), 1);
    }

    #[test]
    fn insert_then_remove_leaves_master_untouched() {
        let (db, table, _) = seeded(&["ann"]);
        let master = db.table(table).unwrap();
        let digest = master.state_digest();

        let mut txn = db.create_transaction().unwrap();
        let id = txn.insert_row(table, Row::from_strs(&["tmp", "x"])).unwrap();
        txn.remove_row(table, id).unwrap();
        assert!(txn.journal().normalize().is_empty());
        txn.commit().unwrap();

        assert_eq!(master.state_digest(), digest);
    }

    #[test]
    fn rollback_leaves_digest_and_blocks_unchanged() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        let master = db.table(table).unwrap();
        let digest = master.state_digest();
        let blocks = db.live_blocks().unwrap();

        let mut txn = db.create_transaction().unwrap();
        txn.insert_row(table, Row::from_strs(&["cid", "x"])).unwrap();
        txn.update_row(table, ids[0], Row::from_strs(&["ann", "y"])).unwrap();
        txn.rollback().unwrap();

        assert_eq!(master.state_digest(), digest);
        assert_eq!(db.live_blocks().unwrap(), blocks);
    }

    #[test]
    fn dropping_open_transaction_rolls_back() {
        let (db, table, _) = seeded(&["ann"]);
        {
            let mut txn = db.create_transaction().unwrap();
            txn.insert_row(table, Row::from_strs(&["bob", "x"])).unwrap();
        }
        assert_eq!(db.open_transaction_count(), 0);
        assert_eq!(db.table(table).unwrap().live_row_count(), 1);
    }

    #[test]
    fn gc_waits_for_oldest_reader() {
        let db = Conglomerate::in_memory_with(Config::new().cleanup(CleanupMode::Manual)).unwrap();
        let table = db.transaction(|txn| {
            let table = txn.create_table(people())?;
            txn.insert_row(table, Row::from_strs(&["ann", "oslo"]))?;
            Ok(table)
        })
        .unwrap();
        let id = db.create_transaction().unwrap().row_ids(table).unwrap().next();
        let id = id.unwrap();

        let reader = db.create_transaction().unwrap();
        db.transaction(|txn| txn.remove_row(table, id)).unwrap();

        assert_eq!(db.collect_garbage().unwrap().rows_purged, 0);
        assert!(reader.get_row(table, id).is_ok());

        drop(reader);
        assert_eq!(db.collect_garbage().unwrap().rows_purged, 1);
        assert_eq!(db.table(table).unwrap().tombstone_count(), 0);
    }

    #[test]
    fn inline_gc_runs_when_last_transaction_closes() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        db.transaction(|txn| txn.remove_row(table, ids[0])).unwrap();

        let master = db.table(table).unwrap();
        assert_eq!(master.tombstone_count(), 0);
        assert_eq!(master.indexes().stats().reclaimable_blocks, 0);
        master.verify_persisted().unwrap();
    }

    #[test]
    fn background_gc_eventually_purges() {
        let config = Config::new().cleanup(CleanupMode::Background);
        let db = Conglomerate::in_memory_with(config).unwrap();
        let table = db
            .transaction(|txn| {
                let table = txn.create_table(people())?;
                txn.insert_row(table, Row::from_strs(&["ann", "oslo"]))?;
                Ok(table)
            })
            .unwrap();
        let id = db.create_transaction().unwrap().row_ids(table).unwrap().next().unwrap();
        db.transaction(|txn| txn.remove_row(table, id)).unwrap();

        let master = db.table(table).unwrap();
        for _ in 0..200 {
            if master.tombstone_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(master.tombstone_count(), 0);
    }

    #[test]
    fn collector_merges_wake_ups() {
        let db = Conglomerate::in_memory();
        let collector = db.shared.collector.as_ref().unwrap();
        {
            // The first pass blocks on the commit mutex while the rest queue up.
            let _state = db.shared.state.lock();
            for _ in 0..50 {
                assert!(collector.request());
            }
        }

        for _ in 0..400 {
            if collector.passes() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!((1..=2).contains(&collector.passes()), "{} passes", collector.passes());
    }

    #[test]
    fn collector_stops_with_conglomerate() {
        let db = Conglomerate::in_memory();
        let table = db.transaction(|txn| txn.create_table(people())).unwrap();
        for i in 0..100 {
            let name = format!("u{i}");
            db.transaction(|txn| txn.insert_row(table, Row::from_strs(&[name.as_str(), "oslo"])))
                .unwrap();
        }

        let weak = Arc::downgrade(&db.shared);
        drop(db);
        for _ in 0..400 {
            if weak.upgrade().is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn inline_and_manual_modes_have_no_collector() {
        assert!(inline().shared.collector.is_none());
        let manual = Conglomerate::in_memory_with(Config::new().cleanup(CleanupMode::Manual)).unwrap();
        assert!(manual.shared.collector.is_none());
    }

    #[test]
    fn created_table_is_private_until_commit() {
        let db = Conglomerate::in_memory();
        let mut creator = db.create_transaction().unwrap();
        let table = creator.create_table(people()).unwrap();
        creator.insert_row(table, Row::from_strs(&["ann", "oslo"])).unwrap();

        let other = db.create_transaction().unwrap();
        assert!(other.table_id("people").is_err());
        assert!(db.table_names().is_empty());

        creator.commit().unwrap();
        assert_eq!(db.table_names(), vec!["people".to_string()]);
        assert!(other.table_id("people").is_err());
        let later = db.create_transaction().unwrap();
        assert_eq!(later.table_id("people").unwrap(), table);
        assert_eq!(later.row_count(table).unwrap(), 1);
    }

    #[test]
    fn concurrent_create_with_same_name_conflicts() {
        let db = Conglomerate::in_memory();
        let mut t1 = db.create_transaction().unwrap();
        let mut t2 = db.create_transaction().unwrap();
        t1.create_table(people()).unwrap();
        t2.create_table(people()).unwrap();

        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::TableNameClash(_),
                ..
            }
        ));
    }

    #[test]
    fn drop_table_releases_storage_after_readers_leave() {
        let (db, table, _) = seeded(&["ann", "bob"]);
        let reader = db.create_transaction().unwrap();

        db.transaction(|txn| txn.drop_table(table)).unwrap();
        assert!(db.table(table).is_none());
        assert_eq!(reader.row_count(table).unwrap(), 2);
        assert!(db.live_blocks().unwrap() > 0);

        drop(reader);
        assert_eq!(db.live_blocks().unwrap(), 0);
        assert!(!db.locker().is_locked(table));
    }

    #[test]
    fn writes_to_concurrently_dropped_table_conflict() {
        let (db, table, ids) = seeded(&["ann"]);
        let mut writer = db.create_transaction().unwrap();
        writer.remove_row(table, ids[0]).unwrap();

        db.transaction(|txn| txn.drop_table(table)).unwrap();
        let err = writer.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::TableDropped,
                ..
            }
        ));
    }

    #[test]
    fn concurrent_unique_inserts_conflict_at_commit() {
        let (db, table, _) = seeded(&["ann"]);
        let mut t1 = db.create_transaction().unwrap();
        let mut t2 = db.create_transaction().unwrap();
        t1.insert_row(table, Row::from_strs(&["bob", "x"])).unwrap();
        t2.insert_row(table, Row::from_strs(&["bob", "y"])).unwrap();

        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::UniqueViolation { .. },
                ..
            }
        ));
    }

    #[test]
    fn dirty_select_reports_concurrent_removal() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        let options = TransactionOptions::new().dirty_select(true);
        let mut reader = db.create_transaction_with(options).unwrap();
        assert!(reader.get_row(table, ids[1]).is_ok());

        db.transaction(|txn| txn.remove_row(table, ids[0])).unwrap();

        let err = reader.get_row(table, ids[0]).unwrap_err();
        assert!(matches!(err, CoreError::DirtyRead { row: Some(r), .. } if r == ids[0]));
        assert!(matches!(reader.commit().unwrap_err(), CoreError::DirtyRead { .. }));
    }

    #[test]
    fn history_is_pruned_when_idle() {
        let (db, table, ids) = seeded(&["ann", "bob"]);
        db.transaction(|txn| txn.remove_row(table, ids[0])).unwrap();
        assert!(db.shared.state.lock().history.is_empty());

        let _reader = db.create_transaction().unwrap();
        db.transaction(|txn| txn.remove_row(table, ids[1])).unwrap();
        assert_eq!(db.shared.state.lock().history.len(), 1);
    }

    #[test]
    fn tiny_block_size_is_rejected() {
        let config = Config::new().block_size(16);
        assert!(matches!(
            Conglomerate::in_memory_with(config),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn file_backed_conglomerate_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = Conglomerate::open_file(&dir.path().join("db/tables.blk"), Config::new().block_size(512))
            .unwrap();
        let table = db
            .transaction(|txn| {
                let table = txn.create_table(people())?;
                txn.insert_row(table, Row::from_strs(&["ann", "oslo"]))?;
                Ok(table)
            })
            .unwrap();
        db.sync().unwrap();
        db.table(table).unwrap().verify_persisted().unwrap();
    }
}
