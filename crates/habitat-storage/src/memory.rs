//! In-process store with foreign-key, uniqueness, and restrict-on-delete checks.
//! Backs `--store memory` dry runs and the pipeline tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use habitat_core::{Relation, RowId, Table, RUN_ID_COLUMN};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{relation_tables, CountedRow, DeleteFilter, Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: RowId,
    pub values: Value,
}

impl StoredRow {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }
}

/// One trip to the store, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Insert {
        table: Table,
        rows: Vec<Value>,
        ids: Vec<RowId>,
    },
    InsertRejected {
        table: Table,
        message: String,
    },
    Delete {
        table: Table,
        filter: DeleteFilter,
        deleted: u64,
    },
    DeleteRejected {
        table: Table,
        message: String,
    },
    FetchCounts {
        table: Table,
    },
}

/// Reject any insert batch into `table` containing a row whose `column` equals `equals`.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertFailure {
    pub table: Table,
    pub column: String,
    pub equals: Value,
    pub message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<Table, Vec<StoredRow>>,
    calls: Vec<StoreCall>,
    insert_failures: Vec<InsertFailure>,
    failing_deletes: HashSet<Table>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

fn unique_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::CombinedExperiences => &["country_slug", "animal_slug"],
        Table::ContentSources => &["url"],
        Table::AnimalContentSources => &["animal_slug", "content_source_id"],
        Table::CountryContentSources => &["country_slug", "content_source_id"],
        _ => &[],
    }
}

fn children_of(table: Table) -> impl Iterator<Item = Table> {
    Table::ALL.into_iter().filter(move |t| t.parent() == Some(table))
}

fn parse_row_id(value: Option<&Value>) -> Option<RowId> {
    value
        .cloned()
        .and_then(|v| serde_json::from_value::<RowId>(v).ok())
}

impl MemoryState {
    fn rows(&self, table: Table) -> &[StoredRow] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or_default()
    }

    fn check_insert(&self, table: Table, rows: &[Value]) -> Result<(), String> {
        if let Some(rule) = self.insert_failures.iter().find(|rule| {
            rule.table == table && rows.iter().any(|r| r.get(&rule.column) == Some(&rule.equals))
        }) {
            return Err(rule.message.clone());
        }

        if let (Some(parent), Some(fk)) = (table.parent(), table.foreign_key()) {
            let parent_ids: HashSet<RowId> = self.rows(parent).iter().map(|r| r.id).collect();
            for row in rows {
                match parse_row_id(row.get(fk)) {
                    Some(id) if parent_ids.contains(&id) => {}
                    _ => {
                        return Err(format!(
                            "insert or update on table \"{table}\" violates foreign key constraint on \"{fk}\""
                        ))
                    }
                }
            }
        }

        let unique = unique_columns(table);
        if !unique.is_empty() {
            let key = |v: &Value| unique.iter().map(|c| v.get(*c).cloned()).collect::<Vec<_>>();
            let mut seen: HashSet<String> = self
                .rows(table)
                .iter()
                .map(|r| format!("{:?}", key(&r.values)))
                .collect();
            for row in rows {
                if !seen.insert(format!("{:?}", key(row))) {
                    return Err(format!(
                        "duplicate key value violates unique constraint on {table} ({})",
                        unique.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }

    fn matches(row: &StoredRow, filter: &DeleteFilter) -> bool {
        match filter {
            DeleteFilter::All => true,
            DeleteFilter::RunId(run_id) => parse_row_id(row.get(RUN_ID_COLUMN))
                .is_some_and(|id| id.0 == run_id.0),
            DeleteFilter::Ids(ids) => ids.contains(&row.id),
        }
    }

    /// Ids of `path`'s last table reachable from `root`.
    fn scoped_ids(&self, root: RowId, path: &[Table]) -> Vec<RowId> {
        let mut scope = vec![root];
        for table in path {
            let Some(fk) = table.foreign_key() else {
                return Vec::new();
            };
            scope = self
                .rows(*table)
                .iter()
                .filter(|r| parse_row_id(r.get(fk)).is_some_and(|id| scope.contains(&id)))
                .map(|r| r.id)
                .collect();
        }
        scope
    }

    fn count_into(
        &self,
        root: RowId,
        relations: &[Relation],
        path: &mut Vec<Table>,
        counts: &mut BTreeMap<Table, u64>,
    ) {
        for relation in relations {
            path.push(relation.table);
            *counts.entry(relation.table).or_default() += self.scoped_ids(root, path).len() as u64;
            self.count_into(root, &relation.nested, path, counts);
            path.pop();
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_inserts_where(
        &self,
        table: Table,
        column: &str,
        equals: impl Into<Value>,
        message: &str,
    ) {
        self.state.lock().await.insert_failures.push(InsertFailure {
            table,
            column: column.to_string(),
            equals: equals.into(),
            message: message.to_string(),
        });
    }

    /// Make every delete against `table` fail.
    pub async fn fail_deletes_on(&self, table: Table) {
        self.state.lock().await.failing_deletes.insert(table);
    }

    pub async fn rows(&self, table: Table) -> Vec<StoredRow> {
        self.state.lock().await.rows(table).to_vec()
    }

    pub async fn count(&self, table: Table) -> usize {
        self.state.lock().await.rows(table).len()
    }

    pub async fn total_rows(&self) -> usize {
        self.state.lock().await.tables.values().map(Vec::len).sum()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, table: Table, rows: Vec<Value>) -> Result<Vec<RowId>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().await;
        if let Err(message) = state.check_insert(table, &rows) {
            state.calls.push(StoreCall::InsertRejected {
                table,
                message: message.clone(),
            });
            return Err(StoreError::Rejected {
                table,
                status: 409,
                message,
            });
        }

        let ids: Vec<RowId> = rows.iter().map(|_| RowId::new_v4()).collect();
        let stored = state.tables.entry(table).or_default();
        for (id, row) in ids.iter().zip(&rows) {
            let mut values = row.clone();
            if let Some(object) = values.as_object_mut() {
                object.insert("id".to_string(), Value::String(id.to_string()));
            }
            stored.push(StoredRow { id: *id, values });
        }
        state.calls.push(StoreCall::Insert {
            table,
            rows,
            ids: ids.clone(),
        });
        Ok(ids)
    }

    async fn delete(&self, table: Table, filter: &DeleteFilter) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;

        let doomed: HashSet<RowId> = state
            .rows(table)
            .iter()
            .filter(|r| MemoryState::matches(r, filter))
            .map(|r| r.id)
            .collect();

        let failure = if state.failing_deletes.contains(&table) {
            Some(format!("permission denied for table {table}"))
        } else {
            children_of(table).find_map(|child| {
                let fk = child.foreign_key()?;
                state
                    .rows(child)
                    .iter()
                    .any(|r| parse_row_id(r.get(fk)).is_some_and(|id| doomed.contains(&id)))
                    .then(|| {
                        format!(
                            "update or delete on table \"{table}\" violates foreign key constraint from \"{child}\""
                        )
                    })
            })
        };
        if let Some(message) = failure {
            state.calls.push(StoreCall::DeleteRejected {
                table,
                message: message.clone(),
            });
            return Err(StoreError::Rejected {
                table,
                status: 409,
                message,
            });
        }

        if let Some(rows) = state.tables.get_mut(&table) {
            rows.retain(|r| !doomed.contains(&r.id));
        }
        let deleted = doomed.len() as u64;
        state.calls.push(StoreCall::Delete {
            table,
            filter: filter.clone(),
            deleted,
        });
        Ok(deleted)
    }

    async fn fetch_counts(
        &self,
        table: Table,
        keys: &[(&str, String)],
        relations: &[Relation],
    ) -> Result<Option<CountedRow>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::FetchCounts { table });

        let Some(id) = state
            .rows(table)
            .iter()
            .find(|r| keys.iter().all(|(c, v)| r.str(c) == Some(v.as_str())))
            .map(|r| r.id)
        else {
            return Ok(None);
        };

        let mut counts: BTreeMap<Table, u64> = relation_tables(relations)
            .into_iter()
            .map(|t| (t, 0))
            .collect();
        state.count_into(id, relations, &mut Vec::new(), &mut counts);
        Ok(Some(CountedRow { id, counts }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> (MemoryStore, RowId) {
        let store = MemoryStore::new();
        let ids = store
            .insert(
                Table::CombinedExperiences,
                vec![json!({"country_slug": "kenya", "animal_slug": "lions"})],
            )
            .await
            .unwrap();
        (store, ids[0])
    }

    #[tokio::test]
    async fn child_insert_requires_existing_parent() {
        let (store, parent) = seeded().await;
        store
            .insert(
                Table::RegionalThreats,
                vec![json!({"experience_id": parent, "display_order": 0})],
            )
            .await
            .unwrap();

        let err = store
            .insert(
                Table::RegionalThreats,
                vec![json!({"experience_id": RowId::new_v4(), "display_order": 0})],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("foreign key"));
        assert_eq!(store.count(Table::RegionalThreats).await, 1);
    }

    #[tokio::test]
    async fn duplicate_experience_keys_are_rejected() {
        let (store, _) = seeded().await;
        let err = store
            .insert(
                Table::CombinedExperiences,
                vec![json!({"country_slug": "kenya", "animal_slug": "lions"})],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 409, .. }));
    }

    #[tokio::test]
    async fn parent_delete_is_restricted_while_children_remain() {
        let (store, parent) = seeded().await;
        store
            .insert(
                Table::UniqueApproaches,
                vec![json!({"experience_id": parent})],
            )
            .await
            .unwrap();

        assert!(store
            .delete(Table::CombinedExperiences, &DeleteFilter::All)
            .await
            .is_err());
        assert_eq!(
            store.delete(Table::UniqueApproaches, &DeleteFilter::All).await.unwrap(),
            1
        );
        assert_eq!(
            store.delete(Table::CombinedExperiences, &DeleteFilter::All).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn nested_counts_follow_the_approach_chain() {
        let (store, parent) = seeded().await;
        let approach = store
            .insert(Table::UniqueApproaches, vec![json!({"experience_id": parent})])
            .await
            .unwrap()[0];
        store
            .insert(
                Table::SuccessMetrics,
                vec![
                    json!({"approach_id": approach, "display_order": 0}),
                    json!({"approach_id": approach, "display_order": 1}),
                ],
            )
            .await
            .unwrap();

        let relations = vec![
            Relation::leaf(Table::RegionalThreats),
            Relation::with_nested(
                Table::UniqueApproaches,
                vec![Relation::leaf(Table::SuccessMetrics)],
            ),
        ];
        let counted = store
            .fetch_counts(
                Table::CombinedExperiences,
                &[("country_slug", "kenya".into()), ("animal_slug", "lions".into())],
                &relations,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counted.id, parent);
        assert_eq!(counted.count(Table::RegionalThreats), 0);
        assert_eq!(counted.count(Table::UniqueApproaches), 1);
        assert_eq!(counted.count(Table::SuccessMetrics), 2);

        let missing = store
            .fetch_counts(
                Table::CombinedExperiences,
                &[("country_slug", "peru".into())],
                &relations,
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn injected_failures_reject_the_whole_batch() {
        let store = MemoryStore::new();
        store
            .fail_inserts_where(Table::CombinedExperiences, "animal_slug", "rhinos", "boom")
            .await;
        let err = store
            .insert(
                Table::CombinedExperiences,
                vec![
                    json!({"country_slug": "kenya", "animal_slug": "lions"}),
                    json!({"country_slug": "kenya", "animal_slug": "rhinos"}),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with("boom"));
        assert_eq!(store.total_rows().await, 0);
        assert!(matches!(
            store.calls().await.as_slice(),
            [StoreCall::InsertRejected { .. }]
        ));
    }
}
