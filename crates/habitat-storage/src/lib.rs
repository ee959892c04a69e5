//! Target store access for the migration pipeline: a narrow insert/delete/count
//! contract plus REST, Postgres, and in-memory backends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use habitat_core::{Relation, RowId, RunId, Table};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod postgres;
mod postgrest;

pub use memory::{InsertFailure, MemoryStore, StoreCall, StoredRow};
pub use postgres::PgStore;
pub use postgrest::{PostgrestConfig, PostgrestStore};

pub const CRATE_NAME: &str = "habitat-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {table} failed: {source}")]
    Request {
        table: Table,
        #[source]
        source: reqwest::Error,
    },
    #[error("{table} rejected the request (status {status}): {message}")]
    Rejected {
        table: Table,
        status: u16,
        message: String,
    },
    #[error("database error on {table}: {source}")]
    Database {
        table: Table,
        #[source]
        source: sqlx::Error,
    },
    #[error("unexpected response from {table}: {message}")]
    Decode { table: Table, message: String },
    #[error("insert into {table} returned {returned} ids for {sent} rows")]
    IdCountMismatch {
        table: Table,
        sent: usize,
        returned: usize,
    },
}

impl StoreError {
    pub fn table(&self) -> Table {
        match self {
            Self::Request { table, .. }
            | Self::Rejected { table, .. }
            | Self::Database { table, .. }
            | Self::Decode { table, .. }
            | Self::IdCountMismatch { table, .. } => *table,
        }
    }
}

/// Which rows of a table a delete touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum DeleteFilter {
    All,
    RunId(RunId),
    Ids(Vec<RowId>),
}

/// A parent row located by key with the number of rows under each relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedRow {
    pub id: RowId,
    pub counts: BTreeMap<Table, u64>,
}

impl CountedRow {
    pub fn count(&self, table: Table) -> u64 {
        self.counts.get(&table).copied().unwrap_or(0)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a batch and return the generated ids in input order.
    async fn insert(&self, table: Table, rows: Vec<serde_json::Value>) -> Result<Vec<RowId>, StoreError>;

    /// Delete matching rows and return how many went away.
    async fn delete(&self, table: Table, filter: &DeleteFilter) -> Result<u64, StoreError>;

    /// Look up one row by equality on `keys` and count its related rows in a single query.
    async fn fetch_counts(
        &self,
        table: Table,
        keys: &[(&str, String)],
        relations: &[Relation],
    ) -> Result<Option<CountedRow>, StoreError>;
}

/// All tables reachable from `relations`, parents before their nested tables.
pub fn relation_tables(relations: &[Relation]) -> Vec<Table> {
    let mut out = Vec::new();
    for relation in relations {
        out.push(relation.table);
        out.extend(relation_tables(&relation.nested));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_tables_walks_depth_first() {
        let relations = vec![
            Relation::leaf(Table::RegionalThreats),
            Relation::with_nested(
                Table::UniqueApproaches,
                vec![Relation::leaf(Table::SuccessMetrics)],
            ),
        ];
        assert_eq!(
            relation_tables(&relations),
            vec![
                Table::RegionalThreats,
                Table::UniqueApproaches,
                Table::SuccessMetrics
            ]
        );
    }

    #[test]
    fn store_error_messages_name_the_table() {
        let err = StoreError::Rejected {
            table: Table::RegionalThreats,
            status: 409,
            message: "duplicate key".into(),
        };
        assert_eq!(err.table(), Table::RegionalThreats);
        assert_eq!(
            err.to_string(),
            "regional_threats rejected the request (status 409): duplicate key"
        );
    }
}
