//! Direct Postgres backend over a sqlx pool, for self-hosted targets without the REST layer.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use habitat_core::{Relation, RowId, Table, RUN_ID_COLUMN};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{CountedRow, DeleteFilter, Store, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ten target tables if they are not there yet.
    pub async fn apply_schema(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying schema migrations")
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn insert_sql(table: Table, columns: &[String]) -> String {
    let list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {t} ({list}) SELECT {list} FROM jsonb_populate_recordset(NULL::{t}, $1) RETURNING id",
        t = table.name()
    )
}

/// Subquery selecting the ids of the last table in `path`, scoped to the outer row `p`.
fn scoped_ids_sql(path: &[Table]) -> String {
    match path {
        [] => "SELECT p.id".to_string(),
        [first] => format!(
            "SELECT id FROM {} WHERE {} = p.id",
            first.name(),
            first.foreign_key().unwrap_or("id")
        ),
        [prefix @ .., last] => format!(
            "SELECT id FROM {} WHERE {} IN ({})",
            last.name(),
            last.foreign_key().unwrap_or("id"),
            scoped_ids_sql(prefix)
        ),
    }
}

fn collect_count_columns(relations: &[Relation], path: &mut Vec<Table>, out: &mut Vec<(Table, String)>) {
    for relation in relations {
        path.push(relation.table);
        out.push((
            relation.table,
            format!("(SELECT count(*) FROM ({}) s)", scoped_ids_sql(path)),
        ));
        collect_count_columns(&relation.nested, path, out);
        path.pop();
    }
}

pub(crate) fn counts_sql(table: Table, key_columns: &[&str], relations: &[Relation]) -> (String, Vec<(Table, String)>) {
    let mut columns = Vec::new();
    collect_count_columns(relations, &mut Vec::new(), &mut columns);

    let aliased: Vec<(Table, String)> = columns
        .iter()
        .enumerate()
        .map(|(i, (t, _))| (*t, format!("c{i}")))
        .collect();
    let select = std::iter::once("p.id".to_string())
        .chain(
            columns
                .iter()
                .zip(&aliased)
                .map(|((_, expr), (_, alias))| format!("{expr} AS {alias}")),
        )
        .collect::<Vec<_>>()
        .join(", ");
    let filter = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("p.{} = ${}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let filter = if filter.is_empty() { "TRUE".to_string() } else { filter };

    (
        format!("SELECT {select} FROM {} p WHERE {filter} LIMIT 1", table.name()),
        aliased,
    )
}

#[async_trait]
impl Store for PgStore {
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<RowId>, StoreError> {
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Vec<String> = first
            .as_object()
            .ok_or_else(|| StoreError::Decode {
                table,
                message: "rows must be JSON objects".to_string(),
            })?
            .keys()
            .cloned()
            .collect();
        let sent = rows.len();
        let sql = insert_sql(table, &columns);
        debug!(table = table.name(), rows = sent, "postgres insert");

        let ids: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(Json(Value::Array(rows)))
            .fetch_all(&self.pool)
            .await
            .map_err(|source| StoreError::Database { table, source })?;

        if ids.len() != sent {
            return Err(StoreError::IdCountMismatch {
                table,
                sent,
                returned: ids.len(),
            });
        }
        Ok(ids.into_iter().map(RowId).collect())
    }

    async fn delete(&self, table: Table, filter: &DeleteFilter) -> Result<u64, StoreError> {
        debug!(table = table.name(), ?filter, "postgres delete");
        let result = match filter {
            DeleteFilter::All => {
                let sql = format!("DELETE FROM {}", table.name());
                sqlx::query(&sql).execute(&self.pool).await
            }
            DeleteFilter::RunId(run_id) => {
                let sql = format!("DELETE FROM {} WHERE {} = $1", table.name(), RUN_ID_COLUMN);
                sqlx::query(&sql).bind(run_id.0).execute(&self.pool).await
            }
            DeleteFilter::Ids(ids) => {
                if ids.is_empty() {
                    return Ok(0);
                }
                let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
                let sql = format!("DELETE FROM {} WHERE id = ANY($1)", table.name());
                sqlx::query(&sql).bind(ids).execute(&self.pool).await
            }
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|source| StoreError::Database { table, source })
    }

    async fn fetch_counts(
        &self,
        table: Table,
        keys: &[(&str, String)],
        relations: &[Relation],
    ) -> Result<Option<CountedRow>, StoreError> {
        let key_columns: Vec<&str> = keys.iter().map(|(c, _)| *c).collect();
        let (sql, aliases) = counts_sql(table, &key_columns, relations);

        let mut query = sqlx::query(&sql);
        for (_, value) in keys {
            query = query.bind(value.as_str());
        }
        let Some(row) = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| StoreError::Database { table, source })?
        else {
            return Ok(None);
        };

        let id: Uuid = row
            .try_get("id")
            .map_err(|source| StoreError::Database { table, source })?;
        let mut counts = BTreeMap::new();
        for (counted, alias) in aliases {
            let n: i64 = row
                .try_get(alias.as_str())
                .map_err(|source| StoreError::Database { table, source })?;
            *counts.entry(counted).or_default() += n.max(0) as u64;
        }
        Ok(Some(CountedRow {
            id: RowId(id),
            counts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_lists_columns_twice() {
        let sql = insert_sql(
            Table::EcosystemConnections,
            &["connection".to_string(), "display_order".to_string()],
        );
        assert_eq!(
            sql,
            "INSERT INTO ecosystem_connections (\"connection\", \"display_order\") SELECT \"connection\", \"display_order\" FROM jsonb_populate_recordset(NULL::ecosystem_connections, $1) RETURNING id"
        );
    }

    #[test]
    fn nested_counts_scope_through_the_intermediate_table() {
        let relations = vec![Relation::with_nested(
            Table::UniqueApproaches,
            vec![Relation::leaf(Table::SuccessMetrics)],
        )];
        let (sql, aliases) = counts_sql(
            Table::CombinedExperiences,
            &["country_slug", "animal_slug"],
            &relations,
        );
        assert_eq!(
            aliases,
            vec![
                (Table::UniqueApproaches, "c0".to_string()),
                (Table::SuccessMetrics, "c1".to_string())
            ]
        );
        assert!(sql.contains(
            "SELECT id FROM success_metrics WHERE approach_id IN (SELECT id FROM unique_approaches WHERE experience_id = p.id)"
        ));
        assert!(sql.ends_with("WHERE p.\"country_slug\" = $1 AND p.\"animal_slug\" = $2 LIMIT 1"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
