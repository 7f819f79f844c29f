//! Batch upload orchestrator
//!
//! Rows are written in fixed-size batches. Each batch is an independent
//! request: a failed batch is logged and counted and the run moves on to the
//! next one. There are no retries; re-running an upsert is idempotent.

use anyhow::Result;
use common::model::Table;
use common::store::Store;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Merge on the table's conflict key.
    #[default]
    Upsert,
    Insert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub batch_size: usize,
    pub mode: WriteMode,
}

impl UploadOptions {
    pub fn for_table<T: Table>() -> Self {
        Self {
            batch_size: T::BATCH_SIZE,
            mode: WriteMode::Upsert,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub table: String,
    pub parsed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_batches: Vec<usize>,
}

impl RunSummary {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn print(&self) {
        println!("\n=== {} Summary ===", self.table);
        println!("Parsed: {}", self.parsed);
        println!("Skipped: {}", self.skipped);
        if self.duplicates > 0 {
            println!("Duplicates collapsed: {}", self.duplicates);
        }
        println!("Succeeded: {}", self.succeeded);
        println!("Failed: {}", self.failed);
        if !self.failed_batches.is_empty() {
            let batches: Vec<String> = self.failed_batches.iter().map(|b| b.to_string()).collect();
            println!("Failed batches: {}", batches.join(", "));
        }
    }
}

/// Conflict-key text of a serialized row.
fn conflict_key(row: &Value, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .map(|c| row.get(*c).map(|v| v.to_string()).unwrap_or_default())
        .collect()
}

/// Collapse rows that share a conflict key. The last occurrence wins and
/// keeps the position of the first.
pub fn dedup_by_key(rows: Vec<Value>, columns: &[&str]) -> (Vec<Value>, usize) {
    let mut position: HashMap<Vec<String>, usize> = HashMap::new();
    let mut unique: Vec<Value> = Vec::with_capacity(rows.len());
    let mut duplicates = 0;

    for row in rows {
        let key = conflict_key(&row, columns);
        match position.get(&key) {
            Some(&idx) => {
                unique[idx] = row;
                duplicates += 1;
            }
            None => {
                position.insert(key, unique.len());
                unique.push(row);
            }
        }
    }
    (unique, duplicates)
}

/// Write `rows` to `T::NAME` in batches.
pub async fn upload<T: Table>(
    store: &dyn Store,
    rows: &[T],
    opts: UploadOptions,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new(T::NAME);
    summary.parsed = rows.len();

    let values = rows
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;

    let values = match opts.mode {
        WriteMode::Upsert => {
            let (unique, duplicates) = dedup_by_key(values, T::CONFLICT_KEY);
            summary.duplicates = duplicates;
            unique
        }
        WriteMode::Insert => values,
    };

    let batch_size = opts.batch_size.max(1);
    let total_batches = values.len().div_ceil(batch_size);
    info!(
        table = T::NAME,
        rows = values.len(),
        batches = total_batches,
        mode = ?opts.mode,
        "Uploading"
    );

    for (idx, batch) in values.chunks(batch_size).enumerate() {
        let result = match opts.mode {
            WriteMode::Upsert => store.upsert(T::NAME, batch, T::CONFLICT_KEY).await,
            WriteMode::Insert => store.insert(T::NAME, batch).await,
        };

        match result {
            Ok(written) => {
                summary.succeeded += written;
                println!(
                    "  ✓ Batch {}/{}: {} rows (total ok: {}, failed: {})",
                    idx + 1,
                    total_batches,
                    written,
                    summary.succeeded,
                    summary.failed
                );
            }
            Err(e) => {
                error!(table = T::NAME, batch = idx + 1, error = %e, "Batch failed");
                summary.failed += batch.len();
                summary.failed_batches.push(idx + 1);
                println!(
                    "  ✗ Batch {}/{}: {} rows failed (total ok: {}, failed: {})",
                    idx + 1,
                    total_batches,
                    batch.len(),
                    summary.succeeded,
                    summary.failed
                );
            }
        }
    }

    Ok(summary)
}
