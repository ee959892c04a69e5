//! Relational writer: experience roots first, then every dependent table.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use habitat_core::{
    display_order, display_title, meta_description, to_row, ApproachRow, ChallengeRow,
    EcosystemConnectionRow, ExperienceRow, MetricRow, RelatedExperienceRow, RowId, RunId,
    SourceExperience, Table, ThreatRow,
};
use habitat_storage::{DeleteFilter, Store};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::MigrationError;

pub fn experience_row(exp: &SourceExperience, run_id: RunId) -> ExperienceRow {
    ExperienceRow {
        country_slug: exp.country_slug.clone(),
        animal_slug: exp.animal_slug.clone(),
        slug: exp.slug(),
        country_name: exp.country_name.clone(),
        animal_name: exp.animal_name.clone(),
        title: display_title(exp),
        meta_description: meta_description(exp),
        overview: exp.overview.clone(),
        conservation_context: exp.conservation_context.clone(),
        best_time_to_visit: exp.best_time_to_visit.clone(),
        status: exp.status.as_str().to_string(),
        migration_run_id: run_id,
    }
}

pub fn threat_rows(exp: &SourceExperience, experience_id: RowId, run_id: RunId) -> Vec<ThreatRow> {
    exp.primary_threats
        .iter()
        .enumerate()
        .map(|(i, t)| ThreatRow {
            experience_id,
            name: t.name.clone(),
            description: t.description.clone(),
            severity: t.severity.clone(),
            category: t.category.clone(),
            display_order: display_order(i),
            migration_run_id: run_id,
        })
        .collect()
}

pub fn challenge_rows(exp: &SourceExperience, experience_id: RowId, run_id: RunId) -> Vec<ChallengeRow> {
    exp.seasonal_challenges
        .iter()
        .enumerate()
        .map(|(i, c)| ChallengeRow {
            experience_id,
            season: c.season.clone(),
            challenge: c.challenge.clone(),
            volunteer_impact: c.volunteer_impact.clone(),
            display_order: display_order(i),
            migration_run_id: run_id,
        })
        .collect()
}

pub fn related_rows(
    exp: &SourceExperience,
    experience_id: RowId,
    run_id: RunId,
) -> Vec<RelatedExperienceRow> {
    exp.related_experiences
        .iter_categorized()
        .map(|(category, i, link)| RelatedExperienceRow {
            experience_id,
            relationship_type: category.as_str().to_string(),
            related_country_slug: link.country_slug.clone(),
            related_animal_slug: link.animal_slug.clone(),
            title: link.title.clone(),
            reason: link.reason.clone(),
            display_order: display_order(i),
            migration_run_id: run_id,
        })
        .collect()
}

pub fn ecosystem_rows(
    exp: &SourceExperience,
    experience_id: RowId,
    run_id: RunId,
) -> Vec<EcosystemConnectionRow> {
    exp.ecosystem_connections
        .iter()
        .enumerate()
        .map(|(i, connection)| EcosystemConnectionRow {
            experience_id,
            connection: connection.clone(),
            display_order: display_order(i),
            migration_run_id: run_id,
        })
        .collect()
}

pub fn approach_row(exp: &SourceExperience, experience_id: RowId, run_id: RunId) -> ApproachRow {
    ApproachRow {
        experience_id,
        title: exp.unique_approach.title.clone(),
        description: exp.unique_approach.description.clone(),
        migration_run_id: run_id,
    }
}

pub fn metric_rows(exp: &SourceExperience, approach_id: RowId, run_id: RunId) -> Vec<MetricRow> {
    exp.unique_approach
        .success_metrics
        .iter()
        .enumerate()
        .map(|(i, m)| MetricRow {
            approach_id,
            label: m.label.clone(),
            value: m.value.clone(),
            timeframe: m.timeframe.clone(),
            display_order: display_order(i),
            migration_run_id: run_id,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub index: usize,
    pub slug: String,
    pub experience_id: Option<RowId>,
    pub rows_written: usize,
    pub error: Option<String>,
    pub failed_table: Option<Table>,
    /// A failed record whose written rows could not all be deleted again.
    pub partial_rows_left: bool,
}

impl RecordOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn migrated(index: usize, slug: String, experience_id: RowId, rows_written: usize) -> Self {
        Self {
            index,
            slug,
            experience_id: Some(experience_id),
            rows_written,
            error: None,
            failed_table: None,
            partial_rows_left: false,
        }
    }

    fn failed(index: usize, slug: String, err: &MigrationError, partial_rows_left: bool) -> Self {
        Self {
            index,
            slug,
            experience_id: None,
            rows_written: 0,
            error: Some(err.to_string()),
            failed_table: err.table(),
            partial_rows_left,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub run_id: RunId,
    pub concurrency: usize,
}

#[derive(Debug, Default)]
struct WriteLedger {
    written: Vec<(Table, Vec<RowId>)>,
}

impl WriteLedger {
    fn record(&mut self, table: Table, ids: &[RowId]) {
        if !ids.is_empty() {
            self.written.push((table, ids.to_vec()));
        }
    }

    fn rows(&self) -> usize {
        self.written.iter().map(|(_, ids)| ids.len()).sum()
    }

    async fn compensate(self, store: &dyn Store) -> bool {
        let mut clean = true;
        for (table, ids) in self.written.into_iter().rev() {
            if let Err(err) = store.delete(table, &DeleteFilter::Ids(ids)).await {
                warn!(table = table.name(), error = %err, "compensating delete failed");
                clean = false;
            }
        }
        clean
    }
}

async fn insert_rows<T: Serialize>(
    store: &dyn Store,
    slug: &str,
    table: Table,
    rows: &[T],
) -> Result<Vec<RowId>, MigrationError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let values = rows
        .iter()
        .map(to_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| MigrationError::Encode {
            record: slug.to_string(),
            table,
            source,
        })?;
    let ids = store
        .insert(table, values)
        .await
        .map_err(|source| MigrationError::Write {
            record: slug.to_string(),
            table,
            source,
        })?;
    debug!(table = table.name(), rows = ids.len(), "inserted batch");
    Ok(ids)
}

async fn insert_parent(
    store: &dyn Store,
    exp: &SourceExperience,
    run_id: RunId,
) -> Result<RowId, MigrationError> {
    let slug = exp.slug();
    let ids = insert_rows(
        store,
        &slug,
        Table::CombinedExperiences,
        &[experience_row(exp, run_id)],
    )
    .await?;
    ids.first().copied().ok_or_else(|| MigrationError::MissingId {
        record: slug,
        table: Table::CombinedExperiences,
    })
}

async fn write_children_into(
    store: &dyn Store,
    exp: &SourceExperience,
    experience_id: RowId,
    run_id: RunId,
    ledger: &mut WriteLedger,
) -> Result<(), MigrationError> {
    let slug = exp.slug();

    let ids = insert_rows(store, &slug, Table::RegionalThreats, &threat_rows(exp, experience_id, run_id)).await?;
    ledger.record(Table::RegionalThreats, &ids);

    let ids = insert_rows(store, &slug, Table::SeasonalChallenges, &challenge_rows(exp, experience_id, run_id)).await?;
    ledger.record(Table::SeasonalChallenges, &ids);

    let ids = insert_rows(store, &slug, Table::RelatedExperiences, &related_rows(exp, experience_id, run_id)).await?;
    ledger.record(Table::RelatedExperiences, &ids);

    let ids = insert_rows(store, &slug, Table::EcosystemConnections, &ecosystem_rows(exp, experience_id, run_id)).await?;
    ledger.record(Table::EcosystemConnections, &ids);

    let ids = insert_rows(store, &slug, Table::UniqueApproaches, &[approach_row(exp, experience_id, run_id)]).await?;
    ledger.record(Table::UniqueApproaches, &ids);
    let approach_id = ids.first().copied().ok_or_else(|| MigrationError::MissingId {
        record: slug.clone(),
        table: Table::UniqueApproaches,
    })?;

    let ids = insert_rows(store, &slug, Table::SuccessMetrics, &metric_rows(exp, approach_id, run_id)).await?;
    ledger.record(Table::SuccessMetrics, &ids);

    Ok(())
}

async fn write_children(
    store: &dyn Store,
    index: usize,
    exp: &SourceExperience,
    experience_id: RowId,
    run_id: RunId,
) -> RecordOutcome {
    let mut ledger = WriteLedger::default();
    ledger.record(Table::CombinedExperiences, &[experience_id]);

    match write_children_into(store, exp, experience_id, run_id, &mut ledger).await {
        Ok(()) => {
            let rows = ledger.rows();
            info!(rows, "experience migrated");
            RecordOutcome::migrated(index, exp.slug(), experience_id, rows)
        }
        Err(err) => {
            warn!(error = %err, "experience failed; removing partial rows");
            let clean = ledger.compensate(store).await;
            RecordOutcome::failed(index, exp.slug(), &err, !clean)
        }
    }
}

/// Roots are inserted one at a time in corpus order, then up to `concurrency`
/// records write their dependent tables at once.
pub async fn write_experiences(
    store: Arc<dyn Store>,
    experiences: Arc<[SourceExperience]>,
    options: WriteOptions,
) -> anyhow::Result<Vec<RecordOutcome>> {
    let run_id = options.run_id;
    let mut outcomes = Vec::with_capacity(experiences.len());
    let mut parents = Vec::new();
    let mut seen = HashSet::new();

    for (index, exp) in experiences.iter().enumerate() {
        let slug = exp.slug();
        let span = info_span!("insert_parent", slug = %slug, %run_id);
        if !seen.insert((exp.country_slug.clone(), exp.animal_slug.clone())) {
            let err = MigrationError::DuplicateExperience { record: slug.clone() };
            span.in_scope(|| warn!(error = %err, "skipping duplicate experience"));
            outcomes.push(RecordOutcome::failed(index, slug, &err, false));
            continue;
        }
        match insert_parent(store.as_ref(), exp, run_id).instrument(span.clone()).await {
            Ok(id) => parents.push((index, id)),
            Err(err) => {
                span.in_scope(|| warn!(error = %err, "experience root insert failed"));
                outcomes.push(RecordOutcome::failed(index, slug, &err, false));
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for (index, experience_id) in parents {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("write semaphore closed")?;
        let store = Arc::clone(&store);
        let experiences = Arc::clone(&experiences);
        let span = info_span!("migrate_experience", slug = %experiences[index].slug(), %run_id);
        tasks.spawn(
            async move {
                let outcome =
                    write_children(store.as_ref(), index, &experiences[index], experience_id, run_id)
                        .await;
                drop(permit);
                outcome
            }
            .instrument(span),
        );
    }
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined.context("experience write task panicked")?);
    }

    outcomes.sort_by_key(|o| o.index);
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_core::{
        ExperienceStatus, RelatedExperiences, RelatedLink, SeasonalChallenge, SuccessMetric,
        Threat, UniqueApproach,
    };
    use uuid::Uuid;

    fn sample() -> SourceExperience {
        let threat = |name: &str| Threat {
            name: name.into(),
            description: format!("{name} description"),
            severity: "high".into(),
            category: "poaching".into(),
        };
        let link = |country: &str| RelatedLink {
            country_slug: country.into(),
            animal_slug: "rhinos".into(),
            title: format!("Rhinos in {country}"),
            reason: None,
        };
        SourceExperience {
            country_slug: "south-africa".into(),
            animal_slug: "rhinos".into(),
            country_name: "South Africa".into(),
            animal_name: "Rhinos".into(),
            status: ExperienceStatus::Draft,
            overview: "Support anti-poaching units.".into(),
            conservation_context: String::new(),
            best_time_to_visit: None,
            primary_threats: vec![threat("Horn poaching"), threat("Drought")],
            seasonal_challenges: vec![
                SeasonalChallenge {
                    season: "Full moon".into(),
                    challenge: "Incursions".into(),
                    volunteer_impact: String::new(),
                },
                SeasonalChallenge {
                    season: "Winter".into(),
                    challenge: "Fires".into(),
                    volunteer_impact: String::new(),
                },
            ],
            unique_approach: UniqueApproach {
                title: "Dehorning".into(),
                description: "Vets remove horns".into(),
                success_metrics: vec![SuccessMetric {
                    label: "Losses reduced".into(),
                    value: "78%".into(),
                    timeframe: None,
                }],
            },
            related_experiences: RelatedExperiences {
                same_animal_other_countries: vec![link("kenya"), link("namibia")],
                same_country_other_animals: vec![],
                similar_conservation: vec![link("nepal")],
            },
            ecosystem_connections: vec!["Grazing lawns".into()],
            sources: vec![],
        }
    }

    #[test]
    fn root_row_carries_templated_display_fields() {
        let run = RunId(Uuid::nil());
        let row = experience_row(&sample(), run);
        assert_eq!(row.slug, "south-africa-rhinos");
        assert_eq!(row.title, "Rhinos Conservation in South Africa");
        assert_eq!(row.status, "draft");
        assert_eq!(row.migration_run_id, run);
    }

    #[test]
    fn child_rows_keep_source_positions() {
        let run = RunId(Uuid::nil());
        let parent = RowId(Uuid::new_v4());
        let threats = threat_rows(&sample(), parent, run);
        assert_eq!(
            threats.iter().map(|t| t.display_order).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(threats.iter().all(|t| t.experience_id == parent));
        assert_eq!(threats[1].name, "Drought");

        let challenges = challenge_rows(&sample(), parent, run);
        let shape: Vec<_> = challenges
            .iter()
            .map(|c| (c.season.as_str(), c.display_order))
            .collect();
        assert_eq!(shape, vec![("Full moon", 0), ("Winter", 1)]);
        assert!(challenges.iter().all(|c| c.experience_id == parent));

        let related = related_rows(&sample(), parent, run);
        let shape: Vec<_> = related
            .iter()
            .map(|r| (r.relationship_type.as_str(), r.display_order))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("same_animal_other_countries", 0),
                ("same_animal_other_countries", 1),
                ("similar_conservation", 0),
            ]
        );

        let approach = RowId(Uuid::new_v4());
        let metrics = metric_rows(&sample(), approach, run);
        assert_eq!(metrics[0].approach_id, approach);
        assert_eq!(metrics[0].display_order, 0);
    }
}
