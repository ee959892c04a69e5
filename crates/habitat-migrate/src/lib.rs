//! Migration pipeline: write the corpus into the relational store, roll it
//! back, verify it, and migrate its content sources.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use habitat_content::{load_corpus, ClassificationRules, Corpus};
use habitat_core::{RunId, SourceExperience, Table, TableGroup};
use habitat_storage::{Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub mod config;
pub mod rollback;
pub mod sources;
pub mod verify;
pub mod writer;

pub use config::{build_store, ConfigError, MigrateConfig, StoreBackend, StoreTarget};
pub use rollback::{rollback, RollbackReport, RollbackScope, TableRollback};
pub use sources::{migrate_content_sources, SourcesSummary};
pub use verify::{
    experience_relations, verify_experiences, CountMismatch, RecordVerification, VerificationReport,
    DUPLICATE_EXPERIENCE,
};
pub use writer::{write_experiences, RecordOutcome, WriteOptions};

pub const CRATE_NAME: &str = "habitat-migrate";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{record}: another experience with the same country and animal was already written")]
    DuplicateExperience { record: String },
    #[error("{record}: {source}")]
    Write {
        record: String,
        table: Table,
        #[source]
        source: StoreError,
    },
    #[error("{record}: encoding a {table} row failed: {source}")]
    Encode {
        record: String,
        table: Table,
        #[source]
        source: serde_json::Error,
    },
    #[error("{record}: {table} insert returned no id")]
    MissingId { record: String, table: Table },
}

impl MigrationError {
    /// The table whose write failed, if any.
    pub fn table(&self) -> Option<Table> {
        match self {
            Self::DuplicateExperience { .. } => None,
            Self::Write { table, .. } | Self::Encode { table, .. } | Self::MissingId { table, .. } => {
                Some(*table)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records: Vec<RecordOutcome>,
}

impl MigrationSummary {
    pub fn failures(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.records.iter().filter(|r| !r.succeeded())
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "migration {}: {} succeeded, {} failed of {}\n",
            self.run_id, self.succeeded, self.failed, self.total
        );
        for record in self.failures() {
            let error = record.error.as_deref().unwrap_or_default();
            out.push_str(&format!("  failed {}: {error}\n", record.slug));
            if record.partial_rows_left {
                out.push_str("    partial rows could not be removed; run a rollback for this run id\n");
            }
        }
        out
    }
}

pub struct MigrationPipeline {
    store: Arc<dyn Store>,
    corpus: Corpus,
    experiences: Arc<[SourceExperience]>,
    rules: ClassificationRules,
    write_concurrency: usize,
}

impl MigrationPipeline {
    pub fn new(store: Arc<dyn Store>, corpus: Corpus, rules: ClassificationRules) -> Self {
        let experiences = corpus.experiences.clone().into();
        Self {
            store,
            corpus,
            experiences,
            rules,
            write_concurrency: 1,
        }
    }

    pub fn with_write_concurrency(mut self, concurrency: usize) -> Self {
        self.write_concurrency = concurrency.max(1);
        self
    }

    /// Load the corpus and rules named by `config` and connect to its store.
    pub async fn from_config(config: &MigrateConfig) -> Result<Self> {
        let corpus = load_corpus(&config.data_dir)?;
        let rules = if config.rules_dir.exists() {
            ClassificationRules::from_rules_dir(&config.rules_dir)
                .with_context(|| format!("loading rules from {}", config.rules_dir.display()))?
        } else {
            warn!(rules_dir = %config.rules_dir.display(), "rules directory missing; using built-in classification");
            ClassificationRules::default()
        };
        let store = build_store(config).await?;
        Ok(Self::new(store, corpus, rules).with_write_concurrency(config.write_concurrency))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub async fn migrate(&self) -> Result<MigrationSummary> {
        self.migrate_run(RunId::generate()).await
    }

    pub async fn migrate_run(&self, run_id: RunId) -> Result<MigrationSummary> {
        let started_at = Utc::now();
        info!(%run_id, experiences = self.experiences.len(), "starting experience migration");

        let records = write_experiences(
            Arc::clone(&self.store),
            Arc::clone(&self.experiences),
            WriteOptions {
                run_id,
                concurrency: self.write_concurrency,
            },
        )
        .await?;

        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        let summary = MigrationSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            records,
        };
        info!(%run_id, succeeded = summary.succeeded, failed = summary.failed, "experience migration finished");
        Ok(summary)
    }

    pub async fn rollback(&self, scope: RollbackScope) -> RollbackReport {
        rollback(self.store.as_ref(), TableGroup::Experiences, scope).await
    }

    pub async fn verify(&self) -> VerificationReport {
        verify_experiences(self.store.as_ref(), &self.experiences).await
    }

    pub async fn migrate_sources(&self) -> Result<SourcesSummary> {
        let run_id = RunId::generate();
        migrate_content_sources(self.store.as_ref(), &self.corpus, &self.rules, run_id)
            .await
            .context("migrating content sources")
    }

    pub async fn rollback_sources(&self, scope: RollbackScope) -> RollbackReport {
        rollback(self.store.as_ref(), TableGroup::Sources, scope).await
    }
}

/// Write `value` as pretty JSON, creating parent directories.
pub async fn write_json_report<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("serializing report")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_storage::MemoryStore;
    use tempfile::tempdir;

    #[test]
    fn write_errors_report_record_and_store_message() {
        let err = MigrationError::Write {
            record: "kenya-lions".into(),
            table: Table::RegionalThreats,
            source: StoreError::Rejected {
                table: Table::RegionalThreats,
                status: 400,
                message: "null value in column \"name\"".into(),
            },
        };
        assert_eq!(err.table(), Some(Table::RegionalThreats));
        assert_eq!(
            err.to_string(),
            "kenya-lions: regional_threats rejected the request (status 400): null value in column \"name\""
        );
        assert_eq!(
            MigrationError::DuplicateExperience { record: "x".into() }.table(),
            None
        );
    }

    #[tokio::test]
    async fn json_reports_create_parent_dirs() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reports/nested/verify.json");
        write_json_report(&path, &VerificationReport::default())
            .await
            .expect("report");
        let written = std::fs::read_to_string(&path).expect("read back");
        assert!(written.contains("\"records\": []"));
    }

    #[tokio::test]
    async fn empty_corpus_migrates_to_an_empty_summary() {
        let pipeline = MigrationPipeline::new(
            Arc::new(MemoryStore::new()),
            Corpus::default(),
            ClassificationRules::default(),
        );
        let summary = pipeline.migrate().await.expect("summary");
        assert_eq!(summary.total, 0);
        assert!(summary.render().contains("0 succeeded, 0 failed of 0"));
        assert!(pipeline.verify().await.all_passed());
    }
}
