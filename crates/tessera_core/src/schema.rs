//! Table schema metadata.
//!
//! Schemas are owned by the catalog manager; the core reads them to lay
//! out column indexes and enforce unique columns.

use crate::error::{CoreError, CoreResult};
use std::collections::HashSet;

/// Definition of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name, unique within the table.
    pub name: String,
    /// Whether the column has an ordered index.
    pub indexed: bool,
    /// Whether committed rows must have distinct values in this column.
    pub unique: bool,
}

impl ColumnDef {
    /// Creates a plain, unindexed column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            unique: false,
        }
    }

    /// Marks the column as indexed.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Marks the column as unique. Unique columns are always indexed.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.indexed = true;
        self.unique = true;
        self
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name, unique among visible tables.
    pub name: String,
    /// Columns in row order.
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Creates a schema with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Returns the position of a column by name.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns the positions of indexed columns in row order.
    #[must_use]
    pub fn indexed_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.indexed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns the index slot serving a column.
    ///
    /// Slot 0 orders every row by row id; slot `k + 1` serves the k-th
    /// indexed column.
    #[must_use]
    pub fn index_slot(&self, column: usize) -> Option<usize> {
        self.indexed_columns()
            .iter()
            .position(|&c| c == column)
            .map(|k| k + 1)
    }

    /// Number of index slots a table with this schema maintains.
    #[must_use]
    pub fn index_count(&self) -> usize {
        1 + self.columns.iter().filter(|c| c.indexed).count()
    }

    /// Checks the schema is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` for an empty table name, no columns,
    /// duplicate column names, or a unique column without an index.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::invalid_schema("table name is empty"));
        }
        if self.columns.is_empty() {
            return Err(CoreError::invalid_schema(format!(
                "table '{}' has no columns",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
            if column.unique && !column.indexed {
                return Err(CoreError::invalid_schema(format!(
                    "unique column '{}' must be indexed",
                    column.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> TableSchema {
        TableSchema::new("people")
            .column(ColumnDef::new("id").unique())
            .column(ColumnDef::new("name"))
            .column(ColumnDef::new("city").indexed())
    }

    #[test]
    fn index_slots_follow_indexed_columns() {
        let schema = people();
        assert_eq!(schema.indexed_columns(), vec![0, 2]);
        assert_eq!(schema.index_slot(0), Some(1));
        assert_eq!(schema.index_slot(1), None);
        assert_eq!(schema.index_slot(2), Some(2));
        assert_eq!(schema.index_count(), 3);
    }

    #[test]
    fn unique_implies_indexed() {
        let column = ColumnDef::new("email").unique();
        assert!(column.indexed);
        assert!(column.unique);
    }

    #[test]
    fn validate_accepts_good_schema() {
        assert!(people().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicates_and_empty() {
        let dup = TableSchema::new("t")
            .column(ColumnDef::new("a"))
            .column(ColumnDef::new("a"));
        assert!(matches!(dup.validate(), Err(CoreError::InvalidSchema { .. })));

        assert!(TableSchema::new("t").validate().is_err());
        assert!(TableSchema::new(" ")
            .column(ColumnDef::new("a"))
            .validate()
            .is_err());
    }

    #[test]
    fn validate_rejects_unindexed_unique() {
        let mut column = ColumnDef::new("a");
        column.unique = true;
        let schema = TableSchema::new("t").column(column);
        assert!(schema.validate().is_err());
    }
}
