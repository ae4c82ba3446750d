//! Test fixtures and conglomerate helpers.
//!
//! Provides convenience functions for setting up conglomerates and
//! common table layouts.

use std::path::PathBuf;
use tempfile::TempDir;
use tessera_core::{CleanupMode, Config, Conglomerate};

/// A test conglomerate with automatic cleanup.
pub struct TestConglomerate {
    /// The conglomerate instance.
    pub db: Conglomerate,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestConglomerate {
    /// Creates a new in-memory conglomerate.
    ///
    /// Garbage is collected inline, so block and tombstone counts are
    /// settled when a commit returns.
    pub fn memory() -> Self {
        Self::memory_with(Config::default().cleanup(CleanupMode::Inline))
    }

    /// Creates an in-memory conglomerate that collects garbage on its
    /// collector thread.
    pub fn background_gc() -> Self {
        Self::memory_with(Config::default().cleanup(CleanupMode::Background))
    }

    /// Creates an in-memory conglomerate with a custom configuration.
    pub fn memory_with(config: Config) -> Self {
        crate::init_tracing();
        Self {
            db: Conglomerate::in_memory_with(config).expect("Failed to open in-memory conglomerate"),
            temp_dir: None,
        }
    }

    /// Creates an in-memory conglomerate that only collects garbage when
    /// asked to.
    pub fn manual_gc() -> Self {
        Self::memory_with(Config::default().cleanup(CleanupMode::Manual))
    }

    /// Creates a new file-backed conglomerate in a temporary directory.
    pub fn file() -> Self {
        crate::init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("data").join("tables.blk");
        let db = Conglomerate::open_file(&path, Config::default().block_size(1024))
            .expect("Failed to open file conglomerate");

        Self {
            db,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the block file path if file-backed, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir
            .as_ref()
            .map(|d| d.path().join("data").join("tables.blk"))
    }
}

impl std::ops::Deref for TestConglomerate {
    type Target = Conglomerate;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory conglomerate.
///
/// # Example
///
/// ```rust
/// use tessera_testkit::with_conglomerate;
///
/// with_conglomerate(|db| {
///     assert_eq!(db.open_transaction_count(), 0);
/// });
/// ```
pub fn with_conglomerate<F, R>(f: F) -> R
where
    F: FnOnce(&Conglomerate) -> R,
{
    let test_db = TestConglomerate::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-backed conglomerate.
pub fn with_file_conglomerate<F, R>(f: F) -> R
where
    F: FnOnce(&Conglomerate, &std::path::Path) -> R,
{
    let test_db = TestConglomerate::file();
    let path = test_db.path().expect("File conglomerate should have a path");
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use tessera_core::{ColumnDef, Conglomerate, Row, RowId, TableId, TableSchema};

    /// Schema of the `people` table: unique `email`, indexed `city`, and a
    /// plain `note`.
    pub fn people_schema() -> TableSchema {
        TableSchema::new("people")
            .column(ColumnDef::new("email").unique())
            .column(ColumnDef::new("city").indexed())
            .column(ColumnDef::new("note"))
    }

    /// Builds a `people` row.
    pub fn person(email: &str, city: &str) -> Row {
        Row::from_strs(&[email, city, ""])
    }

    /// Creates and commits a `people` table holding `count` rows.
    ///
    /// Row `i` has email `user{i}@example.com` and one of four cities.
    /// Returns the table and the row ids in insertion order.
    pub fn people(db: &Conglomerate, count: usize) -> (TableId, Vec<RowId>) {
        const CITIES: [&str; 4] = ["oslo", "rome", "lima", "kyiv"];
        db.transaction(|txn| {
            let table = txn.create_table(people_schema())?;
            let mut rows = Vec::with_capacity(count);
            for i in 0..count {
                let email = format!("user{i}@example.com");
                rows.push(txn.insert_row(table, person(&email, CITIES[i % CITIES.len()]))?);
            }
            Ok((table, rows))
        })
        .expect("Failed to seed people table")
    }

    /// Creates `count` single-column tables named `table_{i}` with one
    /// row each.
    pub fn many_tables(db: &Conglomerate, count: usize) -> Vec<TableId> {
        db.transaction(|txn| {
            let mut tables = Vec::with_capacity(count);
            for i in 0..count {
                let table = txn.create_table(
                    TableSchema::new(format!("table_{i}")).column(ColumnDef::new("value").indexed()),
                )?;
                txn.insert_row(table, Row::new(vec![i.to_string().into_bytes()]))?;
                tables.push(table);
            }
            Ok(tables)
        })
        .expect("Failed to seed tables")
    }
}
