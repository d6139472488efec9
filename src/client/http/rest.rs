//! PostgREST Client
//!
//! Reads go to `GET /rest/v1/{table}` with `column=op.value` filters;
//! writes ask for `Prefer: return=representation` so the stored row comes
//! back. A PATCH or DELETE that matches no row returns an empty
//! representation, which is reported as [`SyncError::Conflict`].

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{authorize, check_status};
use crate::client::api::{QueryApi, WriteApi};
use crate::shared::config::SyncConfig;
use crate::shared::entity::{Entity, Table};
use crate::shared::error::{Result, SyncError};
use crate::shared::query::{Filter, QuerySpec};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Columns requested for `table`, with the joins the cached rows carry
pub fn select_columns(table: Table) -> &'static str {
    match table {
        Table::Channels => "*,channel_members(user_id,profiles(username,profile_picture_url))",
        Table::Presence => "*,profiles(username,profile_picture_url)",
        _ => "*",
    }
}

/// Primary key column used for PATCH and DELETE
pub fn key_column(table: Table) -> &'static str {
    match table {
        Table::Presence => "user_id",
        _ => "id",
    }
}

/// Query-string pairs for `spec`
pub fn query_params(spec: &QuerySpec) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), select_columns(spec.table).to_string())];
    for filter in &spec.filters {
        let value = match filter {
            Filter::Eq(_, value) => format!("eq.{}", value),
            Filter::IsNull(_) => "is.null".to_string(),
            Filter::Gt(_, value) => format!("gt.{}", value),
        };
        params.push((filter.column().to_string(), value));
    }
    if let Some(order) = &spec.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    params
}

/// REST client for the hosted database
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SyncError::config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.api_endpoint("/rest/v1"),
            api_key: config.api_key.clone(),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}", self.base_url, table)
    }

    /// Decode the first row of a representation, `None` if it is empty
    fn first_row(table: Table, rows: Vec<serde_json::Value>) -> Result<Option<Entity>> {
        rows.first().map(|row| Entity::from_row(table, row)).transpose()
    }
}

#[async_trait]
impl QueryApi for RestClient {
    async fn query(&self, spec: &QuerySpec) -> Result<Vec<Entity>> {
        let table = spec.table;
        tracing::debug!("[Http] GET {} ({} filters)", table, spec.filters.len());
        let request = self
            .client
            .get(self.table_url(table))
            .query(&query_params(spec));
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::fetch(table.as_str(), e.to_string()))?;
        let response = check_status(response, |msg| SyncError::fetch(table.as_str(), msg)).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        rows.iter().map(|row| Entity::from_row(table, row)).collect()
    }
}

#[async_trait]
impl WriteApi for RestClient {
    async fn insert(&self, table: Table, row: serde_json::Value) -> Result<Entity> {
        tracing::debug!("[Http] POST {}", table);
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("select", select_columns(table))])
            .header("Prefer", "return=representation")
            .json(&row);
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::mutation(table.as_str(), e.to_string()))?;
        let response = check_status(response, |msg| SyncError::mutation(table.as_str(), msg)).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        Self::first_row(table, rows)?
            .ok_or_else(|| SyncError::mutation(table.as_str(), "insert returned no row"))
    }

    async fn insert_rows(&self, table: Table, rows: Vec<serde_json::Value>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        tracing::debug!("[Http] POST {} ({} rows)", table, rows.len());
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=minimal")
            .json(&rows);
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::mutation(table.as_str(), e.to_string()))?;
        check_status(response, |msg| SyncError::mutation(table.as_str(), msg)).await?;
        Ok(())
    }

    async fn update(&self, table: Table, id: &str, patch: serde_json::Value) -> Result<Entity> {
        tracing::debug!("[Http] PATCH {} {}", table, id);
        let filter = format!("eq.{}", id);
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[(key_column(table), filter.as_str()), ("select", select_columns(table))])
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::mutation(id, e.to_string()))?;
        let response = check_status(response, |msg| SyncError::mutation(id, msg)).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        Self::first_row(table, rows)?.ok_or_else(|| SyncError::conflict(id))
    }

    async fn delete(&self, table: Table, id: &str) -> Result<()> {
        tracing::debug!("[Http] DELETE {} {}", table, id);
        let filter = format!("eq.{}", id);
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[(key_column(table), filter.as_str())])
            .header("Prefer", "return=representation");
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::mutation(id, e.to_string()))?;
        let response = check_status(response, |msg| SyncError::mutation(id, msg)).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        if rows.is_empty() {
            return Err(SyncError::conflict(id));
        }
        Ok(())
    }

    async fn upsert(&self, table: Table, row: serde_json::Value, on_conflict: &str) -> Result<Entity> {
        tracing::debug!("[Http] UPSERT {} on {}", table, on_conflict);
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict), ("select", select_columns(table))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row);
        let response = authorize(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(|e| SyncError::mutation(table.as_str(), e.to_string()))?;
        let response = check_status(response, |msg| SyncError::mutation(table.as_str(), msg)).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;
        Self::first_row(table, rows)?
            .ok_or_else(|| SyncError::mutation(table.as_str(), "upsert returned no row"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::query::QueryKey;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_top_level_messages_params() {
        let spec = QueryKey::messages("C1").to_query(Utc::now(), chrono::Duration::seconds(300));
        let params = query_params(&spec);
        assert_eq!(param(&params, "channel_id"), Some("eq.C1"));
        assert_eq!(param(&params, "thread_id"), Some("is.null"));
        assert_eq!(param(&params, "order"), Some("created_at.asc"));
        assert_eq!(param(&params, "select"), Some("*"));
    }

    #[test]
    fn test_presence_params_use_window() {
        let spec = QueryKey::Presence.to_query(Utc::now(), chrono::Duration::seconds(300));
        let params = query_params(&spec);
        assert!(param(&params, "last_seen").unwrap().starts_with("gt."));
        assert_eq!(param(&params, "order"), None);
        assert!(param(&params, "select").unwrap().contains("profiles"));
    }

    #[test]
    fn test_key_columns() {
        assert_eq!(key_column(Table::Presence), "user_id");
        assert_eq!(key_column(Table::Messages), "id");
    }
}
