//! Open transaction list.

use crate::types::{CommitId, TransactionId};
use std::collections::{BTreeSet, HashMap};

/// Transactions not yet closed, ordered by start commit id.
///
/// The smallest start commit id bounds what garbage collection may
/// reclaim: a row tombstoned at commit `c` is still visible to every
/// transaction that started before `c`.
#[derive(Debug, Default)]
pub(crate) struct OpenTransactionList {
    entries: BTreeSet<(CommitId, TransactionId)>,
    starts: HashMap<TransactionId, CommitId>,
}

impl OpenTransactionList {
    pub(crate) fn insert(&mut self, id: TransactionId, start: CommitId) {
        if let Some(previous) = self.starts.insert(id, start) {
            self.entries.remove(&(previous, id));
        }
        self.entries.insert((start, id));
    }

    /// Removes a transaction. Returns false if it was not listed.
    pub(crate) fn remove(&mut self, id: TransactionId) -> bool {
        match self.starts.remove(&id) {
            Some(start) => self.entries.remove(&(start, id)),
            None => false,
        }
    }

    /// Smallest start commit id among open transactions.
    pub(crate) fn min_start(&self) -> Option<CommitId> {
        self.entries.first().map(|(start, _)| *start)
    }

    pub(crate) fn len(&self) -> usize {
        self.starts.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_start_tracks_oldest() {
        let mut list = OpenTransactionList::default();
        assert_eq!(list.min_start(), None);

        list.insert(TransactionId::new(2), CommitId::new(5));
        list.insert(TransactionId::new(1), CommitId::new(3));
        list.insert(TransactionId::new(3), CommitId::new(3));
        assert_eq!(list.len(), 3);
        assert_eq!(list.min_start(), Some(CommitId::new(3)));

        assert!(list.remove(TransactionId::new(1)));
        assert_eq!(list.min_start(), Some(CommitId::new(3)));
        assert!(list.remove(TransactionId::new(3)));
        assert_eq!(list.min_start(), Some(CommitId::new(5)));
    }

    #[test]
    fn remove_unknown_is_false() {
        let mut list = OpenTransactionList::default();
        list.insert(TransactionId::new(1), CommitId::new(0));
        assert!(!list.remove(TransactionId::new(9)));
        assert_eq!(list.len(), 1);
        assert!(list.remove(TransactionId::new(1)));
        assert!(list.is_empty());
    }

    #[test]
    fn many_transactions_close_in_any_order() {
        let mut list = OpenTransactionList::default();
        for i in 0..1000 {
            list.insert(TransactionId::new(i), CommitId::new(i / 10));
        }
        for i in (0..1000).rev().step_by(2) {
            assert!(list.remove(TransactionId::new(i)));
        }
        assert_eq!(list.len(), 500);
        assert_eq!(list.min_start(), Some(CommitId::new(0)));

        for i in (0..1000).step_by(2).take(100) {
            assert!(list.remove(TransactionId::new(i)));
        }
        assert_eq!(list.min_start(), Some(CommitId::new(20)));
        assert_eq!(list.entries.len(), list.starts.len());
    }

    #[test]
    fn reinserting_moves_the_entry() {
        let mut list = OpenTransactionList::default();
        list.insert(TransactionId::new(1), CommitId::new(1));
        list.insert(TransactionId::new(1), CommitId::new(4));
        assert_eq!(list.len(), 1);
        assert_eq!(list.min_start(), Some(CommitId::new(4)));
        assert!(list.remove(TransactionId::new(1)));
        assert_eq!(list.min_start(), None);
    }
}
