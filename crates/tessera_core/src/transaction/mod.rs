//! Transactions and their journals.
//!
//! A [`Transaction`] is created by the conglomerate against the current
//! commit id. It reads through copy-on-write index snapshots, records its
//! writes in a [`Journal`], and publishes them at commit after validating
//! the journal against every transaction that committed in the meantime.

mod journal;
mod state;

pub use journal::{Journal, JournalEntry, TableChanges};
pub use state::{Transaction, TransactionState};

pub(crate) use state::TableView;
