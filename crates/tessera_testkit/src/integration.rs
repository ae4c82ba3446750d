//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] runs single-transaction operations against one
//! table and tracks the rows every commit should leave behind.

use crate::fixtures::scenarios;
use std::collections::BTreeMap;
use tessera_core::{
    CleanupMode, Config, Conglomerate, CoreResult, Row, RowId, TableId, Transaction,
};

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The conglomerate instance.
    pub db: Conglomerate,
    /// The `people` table every operation targets.
    pub table: TableId,
    rows: BTreeMap<RowId, Row>,
}

impl IntegrationHarness {
    /// Creates a harness over an in-memory conglomerate with an empty
    /// `people` table. Garbage is collected inline.
    pub fn new() -> Self {
        crate::init_tracing();
        let config = Config::default().cleanup(CleanupMode::Inline);
        let db = Conglomerate::in_memory_with(config).expect("Failed to open in-memory conglomerate");
        Self::with_conglomerate(db)
    }

    /// Creates a harness over an existing conglomerate.
    pub fn with_conglomerate(db: Conglomerate) -> Self {
        let (table, _) = scenarios::people(&db, 0);
        Self {
            db,
            table,
            rows: BTreeMap::new(),
        }
    }

    /// Inserts a row and tracks it for later verification.
    pub fn insert(&mut self, email: &str, city: &str) -> RowId {
        let row = scenarios::person(email, city);
        let id = self
            .db
            .transaction(|txn| txn.insert_row(self.table, row.clone()))
            .expect("Failed to insert row");
        self.rows.insert(id, row);
        id
    }

    /// Replaces a row and tracks the new version.
    pub fn update(&mut self, id: RowId, email: &str, city: &str) -> RowId {
        let row = scenarios::person(email, city);
        let new = self
            .db
            .transaction(|txn| txn.update_row(self.table, id, row.clone()))
            .expect("Failed to update row");
        self.rows.remove(&id);
        self.rows.insert(new, row);
        new
    }

    /// Removes a row and updates tracking.
    pub fn remove(&mut self, id: RowId) {
        self.db
            .transaction(|txn| txn.remove_row(self.table, id))
            .expect("Failed to remove row");
        self.rows.remove(&id);
    }

    /// Runs a transaction whose outcome the caller inspects. Tracking is
    /// not updated.
    pub fn attempt<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut Transaction, TableId) -> CoreResult<R>,
    {
        self.db.transaction(|txn| f(txn, self.table))
    }

    /// Verifies a fresh transaction sees exactly the tracked rows, and
    /// that memory and the block store agree.
    pub fn verify_all(&self) {
        let txn = self.db.create_transaction().expect("Failed to begin");
        let ids: Vec<RowId> = txn.row_ids(self.table).expect("Failed to scan").collect();
        assert_eq!(
            ids,
            self.rows.keys().copied().collect::<Vec<_>>(),
            "visible row ids differ from tracked rows"
        );
        for (id, expected) in &self.rows {
            let actual = txn.get_row(self.table, *id).expect("Failed to read row");
            assert_eq!(&*actual, expected, "row data mismatch for {id}");
        }
        drop(txn);

        self.db
            .table(self.table)
            .expect("table should exist")
            .verify_persisted()
            .expect("persisted state differs from memory");
    }

    /// Returns the count of tracked rows.
    pub fn tracked_count(&self) -> usize {
        self.rows.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies that every block a store holds is accounted for by the
/// conglomerate's tables.
///
/// # Panics
///
/// Panics when the counts differ.
pub fn assert_no_leaked_blocks(db: &Conglomerate, store_blocks: u64) {
    let mut accounted = 0u64;
    for name in db.table_names() {
        let master = db.table_by_name(&name).expect("listed table should exist");
        let stats = master.indexes().stats();
        accounted += (master.live_row_count() + master.tombstone_count()) as u64;
        accounted += stats.live_blocks as u64;
    }
    assert_eq!(accounted, store_blocks, "block store holds unaccounted blocks");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestConglomerate;
    use crate::generators::row_strategy;
    use proptest::strategy::{Strategy, ValueTree};
    use proptest::test_runner::TestRunner;
    use std::time::{Duration, Instant};
    use tessera_core::{ColumnDef, ConflictKind, CoreError, LockMode, TableSchema};

    #[test]
    fn harness_tracks_rows() {
        let mut harness = IntegrationHarness::new();
        let ann = harness.insert("ann@x", "oslo");
        let bob = harness.insert("bob@x", "rome");
        harness.insert("cid@x", "lima");
        harness.verify_all();

        let ann = harness.update(ann, "ann@y", "oslo");
        harness.remove(bob);
        harness.verify_all();
        assert_eq!(harness.tracked_count(), 2);

        let clash =
            harness.attempt(|txn, table| txn.insert_row(table, scenarios::person("ann@y", "kyiv")));
        assert!(clash.unwrap_err().is_conflict());
        harness.remove(ann);
        harness.verify_all();
    }

    #[test]
    fn harness_blocks_are_accounted_for() {
        let mut harness = IntegrationHarness::new();
        for i in 0..30 {
            harness.insert(&format!("user{i}@x"), if i % 2 == 0 { "oslo" } else { "rome" });
        }
        let ids: Vec<RowId> = harness.rows.keys().copied().take(10).collect();
        for id in ids {
            harness.remove(id);
        }
        harness.verify_all();
        assert_no_leaked_blocks(&harness.db, harness.db.live_blocks().unwrap());
    }

    #[test]
    fn remove_remove_conflict_then_retry() {
        let db = TestConglomerate::memory();
        let (table, rows) = scenarios::people(&db, 3);

        let mut first = db.create_transaction().unwrap();
        let mut second = db.create_transaction().unwrap();
        first.remove_row(table, rows[1]).unwrap();
        second.remove_row(table, rows[1]).unwrap();
        second.remove_row(table, rows[2]).unwrap();
        first.commit().unwrap();

        let err = second.commit().unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::RowRemoved(row),
                ..
            } if row == rows[1]
        ));
        second.rollback().unwrap();

        db.transaction(|txn| txn.remove_row(table, rows[2])).unwrap();
        let txn = db.create_transaction().unwrap();
        assert_eq!(txn.row_ids(table).unwrap().collect::<Vec<_>>(), vec![rows[0]]);
    }

    #[test]
    fn locker_serializes_writers() {
        let config = Config::default().lock_timeout(Duration::from_millis(50));
        let db = TestConglomerate::memory_with(config);
        let (table, _) = scenarios::people(&db, 1);

        let mut holder = db.create_transaction().unwrap();
        holder.lock_tables(&[table], LockMode::Exclusive).unwrap();

        let mut waiter = db.create_transaction().unwrap();
        let started = Instant::now();
        let err = waiter.lock_tables(&[table], LockMode::Shared).unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));

        holder.commit().unwrap();
        waiter.lock_tables(&[table], LockMode::Shared).unwrap();
        waiter.commit().unwrap();
        assert!(!db.locker().is_locked(table));
    }

    #[test]
    fn background_cleanup_reclaims_dropped_table() {
        let db = TestConglomerate::background_gc();
        let (table, _) = scenarios::people(&db, 20);
        assert!(db.live_blocks().unwrap() > 0);

        db.transaction(|txn| txn.drop_table(table)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while db.live_blocks().unwrap() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(db.live_blocks().unwrap(), 0);
        assert!(db.table_names().is_empty());
    }

    #[test]
    fn arbitrary_rows_survive_file_store() {
        let db = TestConglomerate::file();
        let table = db
            .transaction(|txn| {
                txn.create_table(
                    TableSchema::new("blobs")
                        .column(ColumnDef::new("key").indexed())
                        .column(ColumnDef::new("value")),
                )
            })
            .unwrap();

        let mut runner = TestRunner::deterministic();
        let rows: Vec<Row> = (0..25)
            .map(|_| row_strategy(2).new_tree(&mut runner).unwrap().current())
            .collect();
        let ids = db
            .transaction(|txn| {
                rows.iter()
                    .map(|row| txn.insert_row(table, row.clone()))
                    .collect::<CoreResult<Vec<_>>>()
            })
            .unwrap();
        db.sync().unwrap();

        let txn = db.create_transaction().unwrap();
        for (id, row) in ids.iter().zip(&rows) {
            assert_eq!(&*txn.get_row(table, *id).unwrap(), row);
        }
        let keys = txn.column_index(table, "key").unwrap();
        assert_eq!(keys.len(), 25);
        db.table(table).unwrap().verify_persisted().unwrap();
    }

    #[test]
    fn manual_cleanup_keeps_old_versions_for_readers() {
        let db = TestConglomerate::manual_gc();
        let (table, rows) = scenarios::people(&db, 4);

        let reader = db.create_transaction().unwrap();
        db.transaction(|txn| {
            for row in &rows {
                txn.remove_row(table, *row)?;
            }
            Ok(())
        })
        .unwrap();

        let stats = db.collect_garbage().unwrap();
        assert_eq!(stats.rows_purged, 0);
        assert_eq!(reader.row_count(table).unwrap(), 4);
        drop(reader);

        let stats = db.collect_garbage().unwrap();
        assert_eq!(stats.rows_purged, 4);
        assert!(stats.index_blocks_reclaimed > 0);
    }
}
