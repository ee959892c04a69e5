//! Content-source migration: de-duplicated citations plus their animal and country links.

use habitat_content::{aggregate_corpus, ClassificationRules, ContentSourceEntry, Corpus};
use habitat_core::{
    to_row, AnimalSourceLinkRow, ContentSourceRow, CountrySourceLinkRow, RowId, RunId, Table,
};
use habitat_storage::Store;
use serde::Serialize;
use tracing::{debug, info};

use crate::MigrationError;

const SOURCES_RECORD: &str = "content-sources";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcesSummary {
    pub run_id: RunId,
    pub content_sources: usize,
    pub animal_links: usize,
    pub country_links: usize,
}

pub fn content_source_row(entry: &ContentSourceEntry, run_id: RunId) -> ContentSourceRow {
    ContentSourceRow {
        url: entry.url.clone(),
        organization_name: entry.organization_name.clone(),
        source_type: entry.source_type,
        credibility_score: entry.credibility_score,
        specialization: entry.specialization.clone(),
        migration_run_id: run_id,
    }
}

fn link_notes(entry: &ContentSourceEntry) -> String {
    match entry.citations {
        1 => format!("{} (cited once)", entry.organization_name),
        n => format!("{} (cited {n} times)", entry.organization_name),
    }
}

/// Link rows for every animal and country an entry specializes in.
pub fn link_rows(
    entry: &ContentSourceEntry,
    content_source_id: RowId,
    run_id: RunId,
) -> (Vec<AnimalSourceLinkRow>, Vec<CountrySourceLinkRow>) {
    let notes = link_notes(entry);
    let animals = entry
        .specialization
        .animals
        .iter()
        .map(|animal| AnimalSourceLinkRow {
            animal_slug: animal.clone(),
            content_source_id,
            relevance_score: entry.credibility_score,
            notes: notes.clone(),
            migration_run_id: run_id,
        })
        .collect();
    let countries = entry
        .specialization
        .countries
        .iter()
        .map(|country| CountrySourceLinkRow {
            country_slug: country.clone(),
            content_source_id,
            relevance_score: entry.credibility_score,
            notes: notes.clone(),
            migration_run_id: run_id,
        })
        .collect();
    (animals, countries)
}

async fn insert_all<T: Serialize>(
    store: &dyn Store,
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
            record: SOURCES_RECORD.to_string(),
            table,
            source,
        })?;
    let ids = store
        .insert(table, values)
        .await
        .map_err(|source| MigrationError::Write {
            record: SOURCES_RECORD.to_string(),
            table,
            source,
        })?;
    debug!(table = table.name(), rows = ids.len(), "inserted batch");
    Ok(ids)
}

/// Aggregate and write every cited source. Any failed insert aborts the run;
/// a sources rollback clears what was written.
pub async fn migrate_content_sources(
    store: &dyn Store,
    corpus: &Corpus,
    rules: &ClassificationRules,
    run_id: RunId,
) -> Result<SourcesSummary, MigrationError> {
    let entries = aggregate_corpus(&corpus.hubs, &corpus.experiences, rules);
    info!(sources = entries.len(), "aggregated content sources");

    let rows: Vec<_> = entries.iter().map(|e| content_source_row(e, run_id)).collect();
    let ids = insert_all(store, Table::ContentSources, &rows).await?;

    let mut animal_links = Vec::new();
    let mut country_links = Vec::new();
    for (entry, id) in entries.iter().zip(ids) {
        let (animals, countries) = link_rows(entry, id, run_id);
        animal_links.extend(animals);
        country_links.extend(countries);
    }
    insert_all(store, Table::AnimalContentSources, &animal_links).await?;
    insert_all(store, Table::CountryContentSources, &country_links).await?;

    let summary = SourcesSummary {
        run_id,
        content_sources: rows.len(),
        animal_links: animal_links.len(),
        country_links: country_links.len(),
    };
    info!(
        sources = summary.content_sources,
        animal_links = summary.animal_links,
        country_links = summary.country_links,
        "content sources migrated"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_core::{ContentHub, HubKind, SourceType, Specialization};
    use habitat_storage::MemoryStore;

    fn entry(citations: u32) -> ContentSourceEntry {
        ContentSourceEntry {
            url: "https://www.panthera.org".into(),
            organization_name: "Panthera".into(),
            source_type: SourceType::Organization,
            credibility_score: 95,
            specialization: Specialization {
                animals: vec!["lions".into(), "sea-turtles".into()],
                countries: vec!["costa-rica".into()],
            },
            citations,
        }
    }

    #[test]
    fn links_carry_credibility_and_citation_notes() {
        let id = RowId::new_v4();
        let (animals, countries) = link_rows(&entry(3), id, RunId::generate());
        assert_eq!(animals.len(), 2);
        assert_eq!(countries.len(), 1);
        assert!(animals.iter().all(|a| a.content_source_id == id && a.relevance_score == 95));
        assert_eq!(countries[0].notes, "Panthera (cited 3 times)");
        assert_eq!(link_notes(&entry(1)), "Panthera (cited once)");
    }

    #[tokio::test]
    async fn writes_sources_then_links() {
        let store = MemoryStore::new();
        let corpus = Corpus {
            experiences: Vec::new(),
            hubs: vec![
                ContentHub {
                    kind: HubKind::Animal,
                    slug: "lions".into(),
                    name: None,
                    sources: vec!["https://www.panthera.org".into(), "https://www.kws.go.ke".into()],
                },
                ContentHub {
                    kind: HubKind::Country,
                    slug: "kenya".into(),
                    name: None,
                    sources: vec!["https://www.kws.go.ke/".into()],
                },
            ],
        };
        let run = RunId::generate();
        let summary = migrate_content_sources(&store, &corpus, &ClassificationRules::default(), run)
            .await
            .expect("sources");
        assert_eq!(summary.content_sources, 2);
        assert_eq!(summary.animal_links, 2);
        assert_eq!(summary.country_links, 1);
        assert_eq!(store.count(Table::ContentSources).await, 2);
        assert_eq!(store.count(Table::CountryContentSources).await, 1);

        let kws = store
            .rows(Table::ContentSources)
            .await
            .into_iter()
            .find(|r| r.str("url") == Some("https://www.kws.go.ke"))
            .expect("kws row");
        assert_eq!(kws.str("source_type"), Some("government"));
        assert_eq!(kws.values["specialization"]["countries"][0], "kenya");
    }

    #[tokio::test]
    async fn failed_source_insert_aborts() {
        let store = MemoryStore::new();
        store
            .fail_inserts_where(Table::ContentSources, "organization_name", "Panthera", "boom")
            .await;
        let corpus = Corpus {
            experiences: Vec::new(),
            hubs: vec![ContentHub {
                kind: HubKind::Animal,
                slug: "lions".into(),
                name: None,
                sources: vec!["https://www.panthera.org".into()],
            }],
        };
        let err = migrate_content_sources(&store, &corpus, &ClassificationRules::default(), RunId::generate())
            .await
            .unwrap_err();
        assert_eq!(err.table(), Some(Table::ContentSources));
        assert_eq!(store.total_rows().await, 0);
    }
}
