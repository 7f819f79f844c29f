//! Indicator name backfill for `resultado_indicadores.nombre_indicador`

use crate::orchestrator::RunSummary;
use crate::resolver::{NameResolver, Strategy};
use anyhow::{Context, Result};
use common::config::SchemaVersion;
use common::model::{IndicatorResult, Table};
use common::store::{fetch_all, Filter, Select, Store};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

pub const BACKFILL_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct BackfillOptions {
    pub schema: SchemaVersion,
    pub page_size: usize,
    pub max_rows: usize,
    pub batch_size: usize,
    /// Only touch rows whose name is still null.
    pub only_missing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillReport {
    pub strategy: Option<Strategy>,
    pub scanned: usize,
    pub candidates: usize,
    pub summary: RunSummary,
    pub no_op: bool,
}

impl BackfillReport {
    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }
}

#[derive(Debug, Deserialize)]
struct ResultName {
    id: i64,
    nombre_indicador: Option<String>,
}

/// Rows whose stored name differs from the resolved one.
fn pending_updates(rows: &[ResultName], names: &BTreeMap<i64, String>) -> Vec<(i64, String)> {
    rows.iter()
        .filter_map(|row| {
            let name = names.get(&row.id)?;
            (row.nombre_indicador.as_deref() != Some(name.as_str())).then(|| (row.id, name.clone()))
        })
        .collect()
}

pub async fn backfill_names(store: &dyn Store, opts: BackfillOptions) -> Result<BackfillReport> {
    let mut summary = RunSummary::new(IndicatorResult::NAME);

    let mut resolver = NameResolver::new(store, opts.page_size, opts.max_rows);
    let resolution = resolver.resolve(opts.schema).await?;

    if resolution.is_empty() {
        let tried: Vec<String> = resolution.attempted.iter().map(|s| s.to_string()).collect();
        warn!(schema = %opts.schema, "No name mappings found");
        println!("No name mappings found (tried: {}); nothing to update", tried.join(", "));
        return Ok(BackfillReport {
            strategy: None,
            scanned: 0,
            candidates: 0,
            summary,
            no_op: true,
        });
    }

    println!(
        "Resolved {} result names via {}",
        resolution.names.len(),
        resolution
            .strategy
            .map(|s| s.to_string())
            .unwrap_or_default()
    );

    let filter = if opts.only_missing {
        Filter::new().is_null("nombre_indicador")
    } else {
        Filter::new()
    };
    let rows: Vec<ResultName> = fetch_all(
        store,
        IndicatorResult::NAME,
        Select::columns("id,nombre_indicador").filter(filter),
        "id",
        opts.page_size,
        opts.max_rows,
    )
    .await
    .context("Failed to fetch results")?
    .into_iter()
    .map(serde_json::from_value)
    .collect::<Result<_, _>>()
    .context("Unexpected row in results")?;

    if rows.len() >= opts.max_rows {
        warn!(max_rows = opts.max_rows, "Result scan reached the row cap");
    }

    let updates = pending_updates(&rows, &resolution.names);
    summary.parsed = updates.len();
    info!(scanned = rows.len(), candidates = updates.len(), "Backfill candidates");

    let batch_size = opts.batch_size.max(1);
    let total_batches = updates.len().div_ceil(batch_size);

    for (idx, batch) in updates.chunks(batch_size).enumerate() {
        let requests: Vec<(Filter, serde_json::Value)> = batch
            .iter()
            .map(|(id, name)| (Filter::new().eq("id", *id), json!({ "nombre_indicador": name })))
            .collect();
        let results = join_all(
            requests
                .iter()
                .map(|(filter, body)| store.patch(IndicatorResult::NAME, filter, body)),
        )
        .await;

        let mut batch_failed = 0;
        let mut batch_missing = 0;
        for ((id, _), result) in batch.iter().zip(results) {
            match result {
                Ok(0) => {
                    warn!(batch = idx + 1, id, "Patch matched no rows");
                    batch_missing += 1;
                }
                Ok(_) => summary.succeeded += 1,
                Err(e) => {
                    error!(batch = idx + 1, id, error = %e, "Patch failed");
                    batch_failed += 1;
                }
            }
        }
        summary.failed += batch_failed;
        summary.skipped += batch_missing;
        if batch_failed > 0 {
            summary.failed_batches.push(idx + 1);
        }

        println!(
            "  {} Batch {}/{}: {} updated, {} not found (total ok: {}, failed: {})",
            if batch_failed == 0 { "✓" } else { "✗" },
            idx + 1,
            total_batches,
            batch.len() - batch_failed - batch_missing,
            batch_missing,
            summary.succeeded,
            summary.failed
        );
    }

    Ok(BackfillReport {
        strategy: resolution.strategy,
        scanned: rows.len(),
        candidates: updates.len(),
        summary,
        no_op: false,
    })
}
