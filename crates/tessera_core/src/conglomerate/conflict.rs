//! Commit-time validation.
//!
//! Validation compares the committing transaction's normalized journal
//! with the records of every transaction that committed after it started.
//! Nothing is replayed; only the sets of touched rows and tables are
//! intersected.

use crate::error::{ConflictKind, CoreError, CoreResult};
use crate::transaction::TableChanges;
use crate::types::{CommitId, TableId};
use std::collections::BTreeMap;
use tracing::warn;

/// Net changes of one committed transaction.
#[derive(Debug, Clone)]
pub(crate) struct CommitRecord {
    pub(crate) commit: CommitId,
    pub(crate) tables: BTreeMap<TableId, TableChanges>,
}

/// Checks `ours` against concurrent commits.
///
/// `selected` lists the tables the transaction read from; they matter
/// only in dirty-select mode.
pub(crate) fn validate<'a>(
    ours: &BTreeMap<TableId, TableChanges>,
    selected: &[TableId],
    dirty_select: bool,
    concurrent: impl IntoIterator<Item = &'a CommitRecord>,
) -> CoreResult<()> {
    for record in concurrent {
        for (&table, theirs) in &record.tables {
            if let Some(mine) = ours.get(&table) {
                check_table(table, mine, theirs).inspect_err(|err| {
                    warn!(%table, commit = %record.commit, error = %err, "commit conflict");
                })?;
            }
            if dirty_select && selected.contains(&table) && !theirs.removed.is_empty() {
                warn!(%table, commit = %record.commit, "dirty read detected at commit");
                return Err(CoreError::DirtyRead {
                    table,
                    row: theirs.removed.first().copied(),
                });
            }
        }
    }
    Ok(())
}

fn check_table(table: TableId, mine: &TableChanges, theirs: &TableChanges) -> CoreResult<()> {
    if theirs.dropped {
        return Err(CoreError::conflict(table, ConflictKind::TableDropped));
    }
    if mine.dropped && theirs.is_modified() {
        return Err(CoreError::conflict(table, ConflictKind::TableModified));
    }
    if let Some(&row) = mine.removed.intersection(&theirs.removed).next() {
        return Err(CoreError::conflict(table, ConflictKind::RowRemoved(row)));
    }
    if mine.constraints_altered && theirs.constraints_altered {
        return Err(CoreError::conflict(table, ConflictKind::ConstraintAltered));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowId;
    use std::collections::BTreeSet;

    const T: TableId = TableId::new(1);

    fn removing(rows: &[u64]) -> TableChanges {
        TableChanges {
            removed: rows.iter().map(|&r| RowId::new(r)).collect::<BTreeSet<_>>(),
            ..TableChanges::default()
        }
    }

    fn record(commit: u64, changes: TableChanges) -> CommitRecord {
        CommitRecord {
            commit: CommitId::new(commit),
            tables: BTreeMap::from([(T, changes)]),
        }
    }

    #[test]
    fn overlapping_removals_conflict() {
        let ours = BTreeMap::from([(T, removing(&[2]))]);
        let err = validate(&ours, &[], false, &[record(1, removing(&[2, 3]))]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::RowRemoved(row),
                ..
            } if row == RowId::new(2)
        ));
    }

    #[test]
    fn disjoint_removals_pass() {
        let ours = BTreeMap::from([(T, removing(&[1]))]);
        assert!(validate(&ours, &[], false, &[record(1, removing(&[2]))]).is_ok());
    }

    #[test]
    fn concurrent_drop_conflicts() {
        let ours = BTreeMap::from([(T, removing(&[1]))]);
        let dropped = TableChanges {
            dropped: true,
            ..TableChanges::default()
        };
        let err = validate(&ours, &[], false, &[record(1, dropped)]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::TableDropped,
                ..
            }
        ));
    }

    #[test]
    fn dropping_a_modified_table_conflicts() {
        let ours = BTreeMap::from([(
            T,
            TableChanges {
                dropped: true,
                ..TableChanges::default()
            },
        )]);
        let err = validate(&ours, &[], false, &[record(1, removing(&[4]))]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Conflict {
                kind: ConflictKind::TableModified,
                ..
            }
        ));
    }

    #[test]
    fn double_constraint_alter_conflicts() {
        let altered = TableChanges {
            constraints_altered: true,
            ..TableChanges::default()
        };
        let ours = BTreeMap::from([(T, altered.clone())]);
        assert!(validate(&ours, &[], false, &[record(1, altered)]).is_err());
    }

    #[test]
    fn dirty_select_fails_on_read_table() {
        let ours = BTreeMap::new();
        let concurrent = [record(1, removing(&[9]))];
        assert!(validate(&ours, &[T], false, &concurrent).is_ok());

        let err = validate(&ours, &[T], true, &concurrent).unwrap_err();
        assert!(matches!(err, CoreError::DirtyRead { row: Some(r), .. } if r == RowId::new(9)));
    }
}
