//! Read-only comparison of persisted child counts against the source corpus.

use std::collections::HashSet;

use habitat_core::{Relation, RowId, SourceExperience, Table};
use habitat_storage::{CountedRow, Store};
use serde::Serialize;
use tracing::{info, warn};

pub const DUPLICATE_EXPERIENCE: &str = "duplicate of an earlier experience; not migrated";

/// Child tables counted under each experience row.
pub fn experience_relations() -> Vec<Relation> {
    vec![
        Relation::leaf(Table::RegionalThreats),
        Relation::leaf(Table::SeasonalChallenges),
        Relation::with_nested(
            Table::UniqueApproaches,
            vec![Relation::leaf(Table::SuccessMetrics)],
        ),
        Relation::leaf(Table::RelatedExperiences),
        Relation::leaf(Table::EcosystemConnections),
    ]
}

pub fn count_name(table: Table) -> &'static str {
    match table {
        Table::RegionalThreats => "Regional Threats",
        Table::SeasonalChallenges => "Seasonal Challenges",
        Table::UniqueApproaches => "Unique Approaches",
        Table::SuccessMetrics => "Success Metrics",
        Table::RelatedExperiences => "Related Experiences",
        Table::EcosystemConnections => "Ecosystem Connections",
        other => other.name(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountMismatch {
    pub name: String,
    pub expected: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordVerification {
    pub slug: String,
    pub record_id: Option<RowId>,
    pub passed: bool,
    pub mismatches: Vec<CountMismatch>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct VerificationReport {
    pub records: Vec<RecordVerification>,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.records.iter().all(|r| r.passed)
    }

    pub fn passed(&self) -> usize {
        self.records.iter().filter(|r| r.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.passed()
    }

    pub fn record(&self, slug: &str) -> Option<&RecordVerification> {
        self.records.iter().find(|r| r.slug == slug)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            if record.passed {
                out.push_str(&format!("ok    {}\n", record.slug));
                continue;
            }
            out.push_str(&format!("FAIL  {}\n", record.slug));
            if let Some(err) = &record.error {
                out.push_str(&format!("        {err}\n"));
            } else if record.record_id.is_none() {
                out.push_str("        experience row not found\n");
            }
            for m in &record.mismatches {
                out.push_str(&format!(
                    "        {}: expected {}, actual {}\n",
                    m.name, m.expected, m.actual
                ));
            }
        }
        out.push_str(&format!(
            "{} passed, {} failed of {}\n",
            self.passed(),
            self.failed(),
            self.records.len()
        ));
        out
    }
}

pub fn compare_counts(experience: &SourceExperience, row: &CountedRow) -> Vec<CountMismatch> {
    let expected = experience.expected_counts();
    [
        (Table::RegionalThreats, expected.regional_threats),
        (Table::SeasonalChallenges, expected.seasonal_challenges),
        (Table::UniqueApproaches, expected.unique_approaches),
        (Table::SuccessMetrics, expected.success_metrics),
        (Table::RelatedExperiences, expected.related_experiences),
        (Table::EcosystemConnections, expected.ecosystem_connections),
    ]
    .into_iter()
    .filter_map(|(table, expected)| {
        let actual = row.count(table);
        (actual != expected).then(|| CountMismatch {
            name: count_name(table).to_string(),
            expected,
            actual,
        })
    })
    .collect()
}

async fn verify_one(store: &dyn Store, experience: &SourceExperience) -> RecordVerification {
    let slug = experience.slug();
    let keys = [
        ("country_slug", experience.country_slug.clone()),
        ("animal_slug", experience.animal_slug.clone()),
    ];
    let fetched = store
        .fetch_counts(Table::CombinedExperiences, &keys, &experience_relations())
        .await;

    match fetched {
        Ok(Some(row)) => {
            let mismatches = compare_counts(experience, &row);
            for m in &mismatches {
                warn!(slug = %slug, count = %m.name, expected = m.expected, actual = m.actual, "count mismatch");
            }
            RecordVerification {
                slug,
                record_id: Some(row.id),
                passed: mismatches.is_empty(),
                mismatches,
                error: None,
            }
        }
        Ok(None) => {
            warn!(slug = %slug, "experience row not found");
            RecordVerification {
                slug,
                record_id: None,
                passed: false,
                mismatches: Vec::new(),
                error: None,
            }
        }
        Err(err) => {
            warn!(slug = %slug, error = %err, "verification query failed");
            RecordVerification {
                slug,
                record_id: None,
                passed: false,
                mismatches: Vec::new(),
                error: Some(err.to_string()),
            }
        }
    }
}

/// One count query per experience; nothing is written. A repeated
/// country and animal pair is reported as a duplicate without querying.
pub async fn verify_experiences(
    store: &dyn Store,
    experiences: &[SourceExperience],
) -> VerificationReport {
    let mut records = Vec::with_capacity(experiences.len());
    let mut seen = HashSet::new();
    for experience in experiences {
        if !seen.insert(experience.key()) {
            let slug = experience.slug();
            warn!(slug = %slug, "duplicate experience skipped");
            records.push(RecordVerification {
                slug,
                record_id: None,
                passed: false,
                mismatches: Vec::new(),
                error: Some(DUPLICATE_EXPERIENCE.to_string()),
            });
            continue;
        }
        records.push(verify_one(store, experience).await);
    }
    let report = VerificationReport { records };
    info!(
        passed = report.passed(),
        failed = report.failed(),
        "verification finished"
    );
    report
}
