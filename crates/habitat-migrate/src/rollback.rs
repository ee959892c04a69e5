//! Reverse-dependency deletion of migrated rows.

use habitat_core::{RunId, Table, TableGroup};
use habitat_storage::{DeleteFilter, Store};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "run_id", rename_all = "snake_case")]
pub enum RollbackScope {
    /// Every row of every table in the group, whichever run wrote it.
    AllRows,
    /// Only rows stamped with this run id.
    Run(RunId),
}

impl RollbackScope {
    pub fn filter(self) -> DeleteFilter {
        match self {
            Self::AllRows => DeleteFilter::All,
            Self::Run(run_id) => DeleteFilter::RunId(run_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRollback {
    pub table: Table,
    pub deleted: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub group: TableGroup,
    pub scope: RollbackScope,
    pub tables: Vec<TableRollback>,
}

impl RollbackReport {
    pub fn deleted(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableRollback> {
        self.tables.iter().filter(|t| t.error.is_some())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for t in &self.tables {
            match &t.error {
                None => out.push_str(&format!("  {:<24} {:>6} deleted\n", t.table.name(), t.deleted)),
                Some(err) => out.push_str(&format!("  {:<24} FAILED: {err}\n", t.table.name())),
            }
        }
        out.push_str(&format!("total deleted: {}\n", self.deleted()));
        out
    }
}

/// Delete the group's rows deepest table first. A failing table is logged
/// and recorded; the remaining tables are still attempted.
pub async fn rollback(store: &dyn Store, group: TableGroup, scope: RollbackScope) -> RollbackReport {
    let filter = scope.filter();
    let mut tables = Vec::new();
    for table in group.rollback_order() {
        match store.delete(table, &filter).await {
            Ok(deleted) => {
                info!(table = table.name(), deleted, "rolled back table");
                tables.push(TableRollback {
                    table,
                    deleted,
                    error: None,
                });
            }
            Err(err) => {
                warn!(table = table.name(), error = %err, "rollback failed for table; continuing");
                tables.push(TableRollback {
                    table,
                    deleted: 0,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    RollbackReport {
        group,
        scope,
        tables,
    }
}
