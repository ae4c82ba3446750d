//! Stress runners for Tessera.
//!
//! These runners drive many transactions from several threads and count
//! outcomes. Each returns a [`StressTestResult`] whose counts the caller
//! checks against what snapshot isolation allows.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tessera_core::{ColumnDef, Conglomerate, CoreError, Row, RowId, TableId, TableSchema};
use tracing::debug;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations rejected by commit validation.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        debug!(
            name,
            total = self.total_ops,
            successful = self.successful_ops,
            conflicts = self.conflicts,
            failed = self.failed_ops,
            ops_per_second = self.ops_per_second,
            "stress run finished"
        );
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of the payload cell in bytes.
    pub payload_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            payload_size: 64,
        }
    }
}

#[derive(Default)]
struct Counters {
    successful: AtomicUsize,
    conflicts: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn record<T>(&self, result: &Result<T, CoreError>) {
        let counter = match result {
            Ok(_) => &self.successful,
            Err(err) if err.is_conflict() => &self.conflicts,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.successful.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            start.elapsed(),
        )
    }
}

/// Creates the `log` table used by the writer runners: an indexed
/// `writer` column and a payload.
///
/// # Panics
///
/// Panics if the table cannot be created.
pub fn create_log_table(db: &Conglomerate) -> TableId {
    db.transaction(|txn| {
        txn.create_table(
            TableSchema::new("log")
                .column(ColumnDef::new("writer").indexed())
                .column(ColumnDef::new("payload")),
        )
    })
    .expect("Failed to create log table")
}

/// Every thread inserts its own rows, one transaction per row.
///
/// Inserts never overlap, so every commit should succeed.
pub fn stress_disjoint_writers(
    db: &Conglomerate,
    table: TableId,
    config: &StressConfig,
) -> StressTestResult {
    let counters = Counters::default();
    let payload = vec![b'p'; config.payload_size];
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let counters = &counters;
            let payload = &payload;
            scope.spawn(move || {
                let writer = t.to_string().into_bytes();
                for _ in 0..config.operations {
                    let result = db.transaction(|txn| {
                        txn.insert_row(table, Row::new(vec![writer.clone(), payload.clone()]))
                    });
                    counters.record(&result);
                }
            });
        }
    });

    counters.finish(start)
}

/// Every thread tries to remove every row of `rows`, one transaction per
/// row.
///
/// Each row is removed by exactly one commit; the other attempts either
/// no longer see the row or are rejected at commit.
pub fn stress_conflicting_removers(
    db: &Conglomerate,
    table: TableId,
    rows: &[RowId],
    config: &StressConfig,
) -> StressTestResult {
    let counters = Counters::default();
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let counters = &counters;
            scope.spawn(move || {
                // Threads walk the rows from different starting points.
                let offset = t * rows.len() / config.threads.max(1);
                for i in 0..rows.len() {
                    let row = rows[(offset + i) % rows.len()];
                    let result = db.transaction(|txn| txn.remove_row(table, row));
                    counters.record(&result);
                }
            });
        }
    });

    counters.finish(start)
}

/// Readers repeatedly scan a table while writers insert and remove.
///
/// A reader counts a failure whenever two scans inside one transaction
/// disagree.
pub fn stress_stable_snapshots(
    db: &Conglomerate,
    table: TableId,
    config: &StressConfig,
) -> StressTestResult {
    let counters = Counters::default();
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let counters = &counters;
            let writer = t % 2 == 0;
            scope.spawn(move || {
                let name = t.to_string();
                for i in 0..config.operations {
                    if writer {
                        let result = db.transaction(|txn| {
                            let id = txn.insert_row(table, Row::from_strs(&[name.as_str(), "w"]))?;
                            if i % 2 == 1 {
                                txn.remove_row(table, id)?;
                            }
                            Ok(())
                        });
                        counters.record(&result);
                        continue;
                    }

                    let result = db.create_transaction().and_then(|txn| {
                        let first: Vec<RowId> = txn.row_ids(table)?.collect();
                        let count = txn.row_count(table)?;
                        let second: Vec<RowId> = txn.row_ids(table)?.collect();
                        if first != second || count != first.len() {
                            return Err(CoreError::invalid_operation("snapshot changed during scan"));
                        }
                        Ok(())
                    });
                    counters.record(&result);
                }
            });
        }
    });

    counters.finish(start)
}
