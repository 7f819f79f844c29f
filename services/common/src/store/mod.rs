//! Hosted store access
//!
//! The store is a PostgREST-style REST API over Postgres. `Store` is the seam
//! between the commands and the transport: `RestStore` talks HTTP, while
//! `MemoryStore` keeps tables in memory for dry runs and tests.

mod memory;
mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

use crate::error::Result;
use crate::model::Table;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Page size for paginated selects.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Hard cap on rows scanned by a single run.
pub const DEFAULT_MAX_ROWS: usize = 50_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    IsNull,
    NotNull,
}

/// Row filter, a conjunction of column conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((column.to_string(), Condition::Eq(value.into())));
        self
    }

    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push((column.to_string(), Condition::IsNull));
        self
    }

    pub fn not_null(mut self, column: &str) -> Self {
        self.conditions.push((column.to_string(), Condition::NotNull));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// PostgREST query parameters (`col=eq.value`, `col=is.null`).
    pub fn to_query(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|(column, condition)| {
                let op = match condition {
                    Condition::Eq(value) => format!("eq.{}", scalar_text(value)),
                    Condition::IsNull => "is.null".to_string(),
                    Condition::NotNull => "not.is.null".to_string(),
                };
                (column.clone(), op)
            })
            .collect()
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|(column, condition)| {
            let cell = row.get(column).unwrap_or(&Value::Null);
            match condition {
                Condition::Eq(value) => !cell.is_null() && scalar_text(cell) == scalar_text(value),
                Condition::IsNull => cell.is_null(),
                Condition::NotNull => !cell.is_null(),
            }
        })
    }
}

/// Text form of a scalar cell as it appears in a query string.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    /// Comma-separated column list; `None` selects every column.
    pub columns: Option<String>,
    pub filter: Filter,
    /// Column to order by, ascending.
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Select {
    pub fn columns(columns: &str) -> Self {
        Self {
            columns: Some(columns.to_string()),
            ..Self::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order(mut self, column: &str) -> Self {
        self.order = Some(column.to_string());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = Some(offset);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Value>>;

    async fn count(&self, table: &str) -> Result<u64>;

    /// Insert or merge rows on `on_conflict`; returns the rows written.
    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &[&str]) -> Result<usize>;

    async fn insert(&self, table: &str, rows: &[Value]) -> Result<usize>;

    /// Set `changes` on every row matching `filter`; returns rows updated.
    async fn patch(&self, table: &str, filter: &Filter, changes: &Value) -> Result<usize>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize>;
}

/// Paginated select ordered by `order_by`, stopping after `max_rows` rows.
pub async fn fetch_all(
    store: &dyn Store,
    table: &str,
    query: Select,
    order_by: &str,
    page_size: usize,
    max_rows: usize,
) -> Result<Vec<Value>> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0;

    while rows.len() < max_rows {
        let limit = page_size.min(max_rows - rows.len());
        let page_query = query.clone().order(order_by).page(limit, offset);
        let page = store.select(table, &page_query).await?;
        let fetched = page.len();
        debug!(table, offset, fetched, "Fetched page");
        rows.extend(page);
        if fetched < limit {
            break;
        }
        offset += fetched;
    }

    Ok(rows)
}

/// Typed `fetch_all` over a whole table.
pub async fn fetch_table<T: Table>(
    store: &dyn Store,
    query: Select,
    page_size: usize,
    max_rows: usize,
) -> Result<Vec<T>> {
    let order_by = T::CONFLICT_KEY.first().copied().unwrap_or("id");
    fetch_all(store, T::NAME, query, order_by, page_size, max_rows)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_query_params() {
        let filter = Filter::new()
            .eq("id", 5)
            .eq("pais", "España")
            .is_null("nombre_indicador");
        assert_eq!(
            filter.to_query(),
            vec![
                ("id".to_string(), "eq.5".to_string()),
                ("pais".to_string(), "eq.España".to_string()),
                ("nombre_indicador".to_string(), "is.null".to_string()),
            ]
        );
    }

    #[test]
    fn test_filter_matches() {
        let row = json!({"id": 5, "nombre_indicador": null, "pais": "España"});
        assert!(Filter::new().eq("id", 5).matches(&row));
        assert!(Filter::new().eq("id", "5").matches(&row));
        assert!(Filter::new().is_null("nombre_indicador").matches(&row));
        assert!(Filter::new().is_null("missing_column").matches(&row));
        assert!(!Filter::new().not_null("nombre_indicador").matches(&row));
        assert!(!Filter::new().eq("pais", "Spain").matches(&row));
    }

    #[tokio::test]
    async fn test_fetch_all_paginates_and_caps() {
        let store = MemoryStore::new();
        let rows: Vec<Value> = (1..=25).map(|id| json!({"id": id})).collect();
        store.seed("t", rows);

        let all = fetch_all(&store, "t", Select::default(), "id", 10, 1000)
            .await
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all[0]["id"], 1);
        assert_eq!(all[24]["id"], 25);

        let capped = fetch_all(&store, "t", Select::default(), "id", 10, 15)
            .await
            .unwrap();
        assert_eq!(capped.len(), 15);
        assert_eq!(capped[14]["id"], 15);
    }

    #[tokio::test]
    async fn test_fetch_all_exact_page_multiple() {
        let store = MemoryStore::new();
        store.seed("t", (1..=20).map(|id| json!({"id": id})).collect());
        let all = fetch_all(&store, "t", Select::default(), "id", 10, 1000)
            .await
            .unwrap();
        assert_eq!(all.len(), 20);
    }
}
