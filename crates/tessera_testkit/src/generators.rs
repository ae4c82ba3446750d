//! Property-based test generators using proptest.
//!
//! Provides strategies for rows and row operations against the
//! `people` table of [`crate::fixtures::scenarios`], plus a model the
//! operations are checked against.

use crate::fixtures::scenarios::person;
use proptest::prelude::*;
use std::collections::BTreeMap;
use tessera_core::{ConflictKind, CoreError, CoreResult, Row, RowId, TableId, Transaction};

/// Expected visible rows of one table, keyed by row id.
pub type RowModel = BTreeMap<RowId, Row>;

/// Strategy for generating valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for emails drawn from a small pool so that unique
/// collisions actually happen.
pub fn email_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-e]{1,2}@x").expect("Invalid regex")
}

/// Strategy for cities drawn from a small pool.
pub fn city_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["oslo", "rome", "lima"]).prop_map(str::to_string)
}

/// Strategy for arbitrary rows of a given width.
pub fn row_strategy(width: usize) -> impl Strategy<Value = Row> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), width).prop_map(Row::new)
}

/// One operation against the `people` table.
#[derive(Debug, Clone)]
pub enum RowOp {
    /// Insert a new person.
    Insert {
        /// Email, unique.
        email: String,
        /// City, indexed.
        city: String,
    },
    /// Remove the n-th visible row, modulo the row count.
    Remove(usize),
    /// Replace the n-th visible row, modulo the row count.
    Update {
        /// Position of the target among visible rows.
        target: usize,
        /// New email.
        email: String,
        /// New city.
        city: String,
    },
}

/// Strategy for generating row operations.
pub fn row_op_strategy() -> impl Strategy<Value = RowOp> {
    prop_oneof![
        3 => (email_strategy(), city_strategy())
            .prop_map(|(email, city)| RowOp::Insert { email, city }),
        2 => any::<usize>().prop_map(RowOp::Remove),
        1 => (any::<usize>(), email_strategy(), city_strategy())
            .prop_map(|(target, email, city)| RowOp::Update { target, email, city }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn row_op_sequence_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<RowOp>> {
    prop::collection::vec(row_op_strategy(), min_ops..max_ops)
}

/// Reads a table's visible rows into a model.
///
/// # Errors
///
/// Returns the first read error.
pub fn read_model(txn: &Transaction, table: TableId) -> CoreResult<RowModel> {
    let ids: Vec<RowId> = txn.row_ids(table)?.collect();
    ids.into_iter()
        .map(|id| -> CoreResult<(RowId, Row)> { Ok((id, Row::clone(&*txn.get_row(table, id)?))) })
        .collect()
}

fn email_taken(model: &RowModel, email: &str, except: Option<RowId>) -> bool {
    model
        .iter()
        .any(|(id, row)| Some(*id) != except && row.cell(0) == Some(email.as_bytes()))
}

/// Applies `ops` inside `txn`, keeping `model` in step.
///
/// Unique violations are expected exactly when the model predicts them;
/// any other error is returned.
///
/// # Errors
///
/// Returns an unexpected core error.
///
/// # Panics
///
/// Panics when the transaction and the model disagree about a unique
/// violation.
pub fn apply_ops(
    txn: &mut Transaction,
    table: TableId,
    ops: &[RowOp],
    model: &mut RowModel,
) -> CoreResult<()> {
    for op in ops {
        match op {
            RowOp::Insert { email, city } => {
                let row = person(email, city);
                let expect_clash = email_taken(model, email, None);
                match txn.insert_row(table, row.clone()) {
                    Ok(id) => {
                        assert!(!expect_clash, "insert of {email} should clash");
                        model.insert(id, row);
                    }
                    Err(err) if expect_clash && is_unique_violation(&err) => {}
                    Err(err) => return Err(err),
                }
            }
            RowOp::Remove(n) => {
                let Some(&id) = nth_key(model, *n) else { continue };
                txn.remove_row(table, id)?;
                model.remove(&id);
            }
            RowOp::Update { target, email, city } => {
                let Some(&id) = nth_key(model, *target) else { continue };
                let row = person(email, city);
                let expect_clash = email_taken(model, email, Some(id));
                match txn.update_row(table, id, row.clone()) {
                    Ok(new) => {
                        assert!(!expect_clash, "update to {email} should clash");
                        model.remove(&id);
                        model.insert(new, row);
                    }
                    Err(err) if expect_clash && is_unique_violation(&err) => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Ok(())
}

fn nth_key(model: &RowModel, n: usize) -> Option<&RowId> {
    if model.is_empty() {
        return None;
    }
    model.keys().nth(n % model.len())
}

fn is_unique_violation(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Conflict {
            kind: ConflictKind::UniqueViolation { .. },
            ..
        }
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{scenarios, TestConglomerate};

    fn city_count(model: &RowModel, city: &str) -> usize {
        model
            .values()
            .filter(|row| row.cell(1) == Some(city.as_bytes()))
            .count()
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn table_name_is_valid(name in table_name_strategy()) {
            let first = name.chars().next();
            prop_assert!(first.is_some_and(|c| c.is_ascii_lowercase()));
        }

        #[test]
        fn committed_state_matches_model(ops in row_op_sequence_strategy(1, 40)) {
            let db = TestConglomerate::memory();
            let (table, _) = scenarios::people(&db, 0);

            let mut model = RowModel::new();
            let mut txn = db.create_transaction().unwrap();
            apply_ops(&mut txn, table, &ops, &mut model).unwrap();
            prop_assert_eq!(&read_model(&txn, table).unwrap(), &model);
            txn.commit().unwrap();

            let reader = db.create_transaction().unwrap();
            prop_assert_eq!(&read_model(&reader, table).unwrap(), &model);
            let cities = reader.column_index(table, "city").unwrap();
            for city in ["oslo", "rome", "lima"] {
                prop_assert_eq!(cities.lookup(city.as_bytes()).unwrap().len(), city_count(&model, city));
            }
            prop_assert_eq!(db.table(table).unwrap().live_row_count(), model.len());
            db.table(table).unwrap().verify_persisted().unwrap();
        }

        #[test]
        fn rollback_restores_state(ops in row_op_sequence_strategy(1, 40)) {
            let db = TestConglomerate::memory();
            let (table, _) = scenarios::people(&db, 6);
            let master = db.table(table).unwrap();
            let digest = master.state_digest();
            let blocks = db.live_blocks().unwrap();

            let mut txn = db.create_transaction().unwrap();
            let mut model = read_model(&txn, table).unwrap();
            apply_ops(&mut txn, table, &ops, &mut model).unwrap();
            txn.rollback().unwrap();

            prop_assert_eq!(master.state_digest(), digest);
            prop_assert_eq!(db.live_blocks().unwrap(), blocks);
        }

        #[test]
        fn snapshot_ignores_later_commits(ops in row_op_sequence_strategy(1, 40)) {
            let db = TestConglomerate::memory();
            let (table, _) = scenarios::people(&db, 6);

            let reader = db.create_transaction().unwrap();
            let before = read_model(&reader, table).unwrap();

            let mut writer = db.create_transaction().unwrap();
            let mut model = before.clone();
            apply_ops(&mut writer, table, &ops, &mut model).unwrap();
            writer.commit().unwrap();

            prop_assert_eq!(&read_model(&reader, table).unwrap(), &before);
            drop(reader);

            let fresh = db.create_transaction().unwrap();
            prop_assert_eq!(&read_model(&fresh, table).unwrap(), &model);
        }
    }
}
