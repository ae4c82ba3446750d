//! Committed table storage.

mod master;
mod row;

pub use master::{MasterTableSource, PurgeStats};
pub use row::Row;

pub(crate) use master::StagedTable;
