use super::{Filter, Select, Store};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

/// REST client for the hosted store (`<url>/rest/v1/<table>`).
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
    key: String,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent("Brainnova-Ingest/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    async fn check(method: &'static str, table: &str, resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            method,
            table: table.to_string(),
            status,
            body,
        })
    }

    /// Rows in a `return=representation` body; an empty body counts as zero.
    async fn returned_rows(resp: Response) -> Result<usize> {
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(0);
        }
        let rows: Vec<Value> = serde_json::from_str(&text)?;
        Ok(rows.len())
    }
}

fn key_set(row: &Value) -> BTreeSet<&str> {
    row.as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Split rows into consecutive runs that share one key set. A bulk POST
/// must use the same columns for every row; optional columns are omitted
/// from rows that do not carry them.
fn uniform_runs(rows: &[Value]) -> Vec<&[Value]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for idx in 1..rows.len() {
        if key_set(&rows[idx]) != key_set(&rows[start]) {
            runs.push(&rows[start..idx]);
            start = idx;
        }
    }
    if start < rows.len() {
        runs.push(&rows[start..]);
    }
    runs
}

/// Total from a `Content-Range: 0-24/3573` header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Store for RestStore {
    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Value>> {
        let mut params: Vec<(String, String)> = vec![(
            "select".to_string(),
            query.columns.clone().unwrap_or_else(|| "*".to_string()),
        )];
        params.extend(query.filter.to_query());
        if let Some(order) = &query.order {
            params.push(("order".to_string(), format!("{}.asc", order)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = query.offset {
            params.push(("offset".to_string(), offset.to_string()));
        }

        debug!(table, ?params, "GET");
        let resp = self.request(Method::GET, table).query(&params).send().await?;
        let resp = Self::check("select", table, resp).await?;
        Ok(resp.json().await?)
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let resp = self
            .request(Method::HEAD, table)
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await?;
        let resp = Self::check("count", table, resp).await?;
        resp.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Rejected(format!("no row count returned for {}", table)))
    }

    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &[&str]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        for run in uniform_runs(rows) {
            debug!(table, rows = run.len(), "UPSERT");
            let resp = self
                .request(Method::POST, table)
                .query(&[("on_conflict", on_conflict.join(","))])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(run)
                .send()
                .await?;
            Self::check("upsert", table, resp).await?;
        }
        Ok(rows.len())
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        for run in uniform_runs(rows) {
            debug!(table, rows = run.len(), "INSERT");
            let resp = self
                .request(Method::POST, table)
                .header("Prefer", "return=minimal")
                .json(run)
                .send()
                .await?;
            Self::check("insert", table, resp).await?;
        }
        Ok(rows.len())
    }

    async fn patch(&self, table: &str, filter: &Filter, changes: &Value) -> Result<usize> {
        let resp = self
            .request(Method::PATCH, table)
            .query(&filter.to_query())
            .header("Prefer", "return=representation")
            .json(changes)
            .send()
            .await?;
        let resp = Self::check("patch", table, resp).await?;
        Self::returned_rows(resp).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize> {
        if filter.is_empty() {
            return Err(StoreError::Rejected(format!(
                "refusing to delete every row of {}",
                table
            )));
        }
        let resp = self
            .request(Method::DELETE, table)
            .query(&filter.to_query())
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let resp = Self::check("delete", table, resp).await?;
        Self::returned_rows(resp).await
    }
}
