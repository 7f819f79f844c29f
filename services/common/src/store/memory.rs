use super::{scalar_text, Filter, Select, Store};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// In-memory tables with the same upsert semantics as the hosted store:
/// rows sharing the conflict key are merged column by column.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.lock().entry(table.to_string()).or_default().extend(rows);
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().get(table).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<Value>>> {
        // A poisoned lock only means a test panicked mid-write.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key_of(row: &Value, on_conflict: &[&str]) -> Vec<String> {
    on_conflict
        .iter()
        .map(|column| scalar_text(row.get(*column).unwrap_or(&Value::Null)))
        .collect()
}

fn as_object(row: &Value) -> Result<&Map<String, Value>> {
    row.as_object()
        .ok_or_else(|| StoreError::Rejected(format!("row is not an object: {}", row)))
}

fn compare_cells(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Null, Value::Null) => Ordering::Equal,
        // Postgres sorts nulls last in ascending order.
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => scalar_text(a).cmp(&scalar_text(b)),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Value>> {
        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| query.filter.matches(row))
            .collect();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                compare_cells(
                    a.get(order).unwrap_or(&Value::Null),
                    b.get(order).unwrap_or(&Value::Null),
                )
            });
        }

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        let page = rows.into_iter().skip(offset).take(limit);

        let projected = match query.columns.as_deref() {
            None | Some("*") => page.collect(),
            Some(columns) => {
                let wanted: Vec<&str> = columns.split(',').map(str::trim).collect();
                page.map(|row| {
                    let object: Map<String, Value> = wanted
                        .iter()
                        .map(|c| (c.to_string(), row.get(*c).cloned().unwrap_or(Value::Null)))
                        .collect();
                    Value::Object(object)
                })
                .collect()
            }
        };
        Ok(projected)
    }

    async fn count(&self, table: &str) -> Result<u64> {
        Ok(self.rows(table).len() as u64)
    }

    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &[&str]) -> Result<usize> {
        for row in rows {
            as_object(row)?;
        }
        let mut tables = self.lock();
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = key_of(row, on_conflict);
            match stored.iter_mut().find(|r| key_of(r, on_conflict) == key) {
                Some(existing) => {
                    if let (Some(target), Some(source)) = (existing.as_object_mut(), row.as_object()) {
                        for (column, value) in source {
                            target.insert(column.clone(), value.clone());
                        }
                    }
                }
                None => stored.push(row.clone()),
            }
        }
        Ok(rows.len())
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> Result<usize> {
        for row in rows {
            as_object(row)?;
        }
        self.lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len())
    }

    async fn patch(&self, table: &str, filter: &Filter, changes: &Value) -> Result<usize> {
        let changes = as_object(changes)?;
        let mut tables = self.lock();
        let mut updated = 0;
        if let Some(stored) = tables.get_mut(table) {
            for row in stored.iter_mut().filter(|row| filter.matches(row)) {
                if let Some(target) = row.as_object_mut() {
                    for (column, value) in changes {
                        target.insert(column.clone(), value.clone());
                    }
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
        if filter.is_empty() {
            return Err(StoreError::Rejected(format!(
                "refusing to delete every row of {}",
                table
            )));
        }
        let mut tables = self.lock();
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|row| !filter.matches(row));
        Ok(before - stored.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_merges_on_conflict_key() {
        let store = MemoryStore::new();
        let key = ["id_componente", "id_resultado"];
        store
            .upsert(
                "componente_resultado",
                &[
                    json!({"id_componente": 1, "id_resultado": 5000001}),
                    json!({"id_componente": 2, "id_resultado": 5000002}),
                ],
                &key,
            )
            .await
            .unwrap();
        store
            .upsert(
                "componente_resultado",
                &[json!({"id_componente": 1, "id_resultado": 5000001})],
                &key,
            )
            .await
            .unwrap();
        assert_eq!(store.rows("componente_resultado").len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_provided_columns() {
        let store = MemoryStore::new();
        store.seed("t", vec![json!({"id": 1, "a": "x", "b": "keep"})]);
        store
            .upsert("t", &[json!({"id": 1, "a": "y"})], &["id"])
            .await
            .unwrap();
        assert_eq!(store.rows("t"), vec![json!({"id": 1, "a": "y", "b": "keep"})]);
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_projects() {
        let store = MemoryStore::new();
        store.seed(
            "t",
            vec![
                json!({"id": 3, "pais": "España", "v": 1}),
                json!({"id": 1, "pais": "Francia", "v": 2}),
                json!({"id": 2, "pais": "España", "v": 3}),
            ],
        );
        let rows = store
            .select(
                "t",
                &Select::columns("id,v")
                    .filter(Filter::new().eq("pais", "España"))
                    .order("id"),
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": 2, "v": 3}), json!({"id": 3, "v": 1})]);
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let store = MemoryStore::new();
        store.seed("t", vec![json!({"id": 1, "n": null}), json!({"id": 2, "n": null})]);

        let updated = store
            .patch("t", &Filter::new().eq("id", 2), &json!({"n": "Conectividad"}))
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.rows("t")[1]["n"], "Conectividad");

        let deleted = store.delete("t", &Filter::new().eq("id", 1)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("t").await.unwrap(), 1);

        assert!(store.delete("t", &Filter::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_non_object_rows() {
        let store = MemoryStore::new();
        assert!(store.insert("t", &[json!([1, 2])]).await.is_err());
    }
}
