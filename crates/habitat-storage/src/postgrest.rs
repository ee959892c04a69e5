//! Supabase REST (PostgREST) backend.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use habitat_core::{Relation, RowId, Table, RUN_ID_COLUMN};
use reqwest::header::CONTENT_RANGE;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{relation_tables, CountedRow, DeleteFilter, Store, StoreError};

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub service_role_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
    service_role_key: String,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: RowId,
}

impl PostgrestStore {
    pub fn new(config: PostgrestConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key,
        })
    }

    fn endpoint(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    async fn send(&self, table: Table, request: RequestBuilder) -> Result<Response, StoreError> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .map_err(|source| StoreError::Request { table, source })?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            table,
            status,
            message: error_message(&body),
        })
    }
}

/// PostgREST error bodies carry `{"message": ...}`; fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn delete_query(filter: &DeleteFilter) -> (String, String) {
    match filter {
        // PostgREST refuses an unfiltered DELETE.
        DeleteFilter::All => ("id".to_string(), "not.is.null".to_string()),
        DeleteFilter::RunId(run_id) => (RUN_ID_COLUMN.to_string(), format!("eq.{run_id}")),
        DeleteFilter::Ids(ids) => {
            let list = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            ("id".to_string(), format!("in.({list})"))
        }
    }
}

/// Parse the total from a `Content-Range` value such as `0-9/10` or `*/3`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Embedded-resource select such as `id,regional_threats(count),unique_approaches(id,success_metrics(count))`.
pub(crate) fn select_clause(relations: &[Relation]) -> String {
    let mut parts = vec!["id".to_string()];
    parts.extend(relations.iter().map(relation_select));
    parts.join(",")
}

fn relation_select(relation: &Relation) -> String {
    if relation.nested.is_empty() {
        format!("{}(count)", relation.table.name())
    } else {
        format!("{}({})", relation.table.name(), select_clause(&relation.nested))
    }
}

fn accumulate_counts(
    relations: &[Relation],
    object: &Value,
    counts: &mut BTreeMap<Table, u64>,
) -> Result<(), String> {
    for relation in relations {
        let embedded = object
            .get(relation.table.name())
            .and_then(Value::as_array)
            .ok_or_else(|| format!("missing embedded {}", relation.table))?;

        if relation.nested.is_empty() {
            let total: u64 = embedded
                .iter()
                .filter_map(|v| v.get("count").and_then(Value::as_u64))
                .sum();
            *counts.entry(relation.table).or_default() += total;
        } else {
            *counts.entry(relation.table).or_default() += embedded.len() as u64;
            for child in embedded {
                accumulate_counts(&relation.nested, child, counts)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn parse_counted_row(
    table: Table,
    relations: &[Relation],
    rows: Vec<Value>,
) -> Result<Option<CountedRow>, StoreError> {
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };
    let id: RowId = row
        .get("id")
        .cloned()
        .ok_or_else(|| StoreError::Decode {
            table,
            message: "row without id".to_string(),
        })
        .and_then(|v| {
            serde_json::from_value(v).map_err(|err| StoreError::Decode {
                table,
                message: err.to_string(),
            })
        })?;

    let mut counts: BTreeMap<Table, u64> = relation_tables(relations)
        .into_iter()
        .map(|t| (t, 0))
        .collect();
    accumulate_counts(relations, &row, &mut counts)
        .map_err(|message| StoreError::Decode { table, message })?;

    Ok(Some(CountedRow { id, counts }))
}

#[async_trait]
impl Store for PostgrestStore {
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<RowId>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let sent = rows.len();
        debug!(table = table.name(), rows = sent, "postgrest insert");

        let request = self
            .client
            .post(self.endpoint(table))
            .query(&[("select", "id")])
            .header("Prefer", "return=representation")
            .json(&rows);
        let resp = self.send(table, request).await?;
        let ids: Vec<IdRow> = resp
            .json()
            .await
            .map_err(|err| StoreError::Decode {
                table,
                message: err.to_string(),
            })?;

        if ids.len() != sent {
            return Err(StoreError::IdCountMismatch {
                table,
                sent,
                returned: ids.len(),
            });
        }
        Ok(ids.into_iter().map(|r| r.id).collect())
    }

    async fn delete(&self, table: Table, filter: &DeleteFilter) -> Result<u64, StoreError> {
        if matches!(filter, DeleteFilter::Ids(ids) if ids.is_empty()) {
            return Ok(0);
        }
        debug!(table = table.name(), ?filter, "postgrest delete");

        let (column, predicate) = delete_query(filter);
        let request = self
            .client
            .delete(self.endpoint(table))
            .query(&[(column.as_str(), predicate.as_str())])
            .header("Prefer", "return=minimal,count=exact");
        let resp = self.send(table, request).await?;

        Ok(resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
            .unwrap_or(0))
    }

    async fn fetch_counts(
        &self,
        table: Table,
        keys: &[(&str, String)],
        relations: &[Relation],
    ) -> Result<Option<CountedRow>, StoreError> {
        let mut query: Vec<(String, String)> = keys
            .iter()
            .map(|(column, value)| (column.to_string(), format!("eq.{value}")))
            .collect();
        query.push(("select".to_string(), select_clause(relations)));
        query.push(("limit".to_string(), "1".to_string()));
        debug!(table = table.name(), ?query, "postgrest count query");

        let request = self.client.get(self.endpoint(table)).query(&query);
        let resp = self.send(table, request).await?;
        let rows: Vec<Value> = resp.json().await.map_err(|err| StoreError::Decode {
            table,
            message: err.to_string(),
        })?;
        parse_counted_row(table, relations, rows)
    }
}
