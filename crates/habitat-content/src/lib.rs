//! Source corpus loading, URL classification, and citation de-duplication.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use habitat_core::{ContentHub, SourceExperience};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod aggregate;
pub mod classify;

pub use aggregate::{aggregate_corpus, ContentSourceEntry, SourceAggregation};
pub use classify::{
    canonical_url_key, determine_source_type, extract_organization_name,
    generate_credibility_score, ClassificationRules, OrganizationDirectory, RankedRule,
    RankedRules, UNKNOWN_SOURCE,
};

pub const CRATE_NAME: &str = "habitat-content";

pub const EXPERIENCES_FILE: &str = "combined_experiences.json";
pub const HUBS_FILE: &str = "content_hubs.json";

/// The read-only inputs of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    pub experiences: Vec<SourceExperience>,
    pub hubs: Vec<ContentHub>,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_experiences(path: impl AsRef<Path>) -> Result<Vec<SourceExperience>> {
    read_json_file(path)
}

pub fn load_hubs(path: impl AsRef<Path>) -> Result<Vec<ContentHub>> {
    read_json_file(path)
}

/// Load `combined_experiences.json` (required) and `content_hubs.json`
/// (optional) from `data_dir`.
pub fn load_corpus(data_dir: impl AsRef<Path>) -> Result<Corpus> {
    let data_dir = data_dir.as_ref();
    let experiences = load_experiences(data_dir.join(EXPERIENCES_FILE))?;

    let hubs_path = data_dir.join(HUBS_FILE);
    let hubs = if hubs_path.exists() {
        load_hubs(&hubs_path)?
    } else {
        warn!(path = %hubs_path.display(), "no content hubs file; only experience citations will be aggregated");
        Vec::new()
    };

    info!(
        experiences = experiences.len(),
        hubs = hubs.len(),
        data_dir = %data_dir.display(),
        "loaded corpus"
    );
    Ok(Corpus { experiences, hubs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_core::HubKind;
    use tempfile::tempdir;

    const EXPERIENCE_JSON: &str = r#"[{
        "country_slug": "kenya",
        "animal_slug": "lions",
        "country_name": "Kenya",
        "animal_name": "Lions",
        "status": "published",
        "overview": "Track prides across community conservancies.",
        "primary_threats": [
            {"name": "Retaliatory killing", "description": "Livestock conflict", "severity": "high", "category": "human-wildlife-conflict"}
        ],
        "unique_approach": {
            "title": "Lion Guardians",
            "description": "Warriors become protectors",
            "success_metrics": [{"label": "Lions collared", "value": "42"}]
        },
        "related_experiences": {
            "same_country_other_animals": [
                {"country_slug": "kenya", "animal_slug": "elephants", "title": "Elephants in Kenya"}
            ]
        },
        "sources": ["https://www.panthera.org"]
    }]"#;

    #[test]
    fn corpus_loads_with_optional_hubs() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join(EXPERIENCES_FILE), EXPERIENCE_JSON).unwrap();

        let corpus = load_corpus(dir.path()).expect("corpus");
        assert_eq!(corpus.experiences.len(), 1);
        assert!(corpus.hubs.is_empty());

        let exp = &corpus.experiences[0];
        assert_eq!(exp.slug(), "kenya-lions");
        assert!(exp.seasonal_challenges.is_empty());
        assert_eq!(exp.related_experiences.len(), 1);
        assert_eq!(exp.expected_counts().success_metrics, 1);

        fs::write(
            dir.path().join(HUBS_FILE),
            r#"[{"kind": "animal", "slug": "lions", "sources": ["https://www.panthera.org"]}]"#,
        )
        .unwrap();
        let corpus = load_corpus(dir.path()).expect("corpus");
        assert_eq!(corpus.hubs[0].kind, HubKind::Animal);
    }

    #[test]
    fn missing_experiences_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let err = load_corpus(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains(EXPERIENCES_FILE));
    }

    #[test]
    fn shipped_sample_corpus_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let corpus = load_corpus(root.join("data")).expect("sample corpus");
        assert!(corpus.experiences.len() >= 3);
        assert!(!corpus.hubs.is_empty());
        let rules = ClassificationRules::from_rules_dir(root.join("rules")).expect("rules");
        let entries = aggregate_corpus(&corpus.hubs, &corpus.experiences, &rules);
        let mut keys: Vec<_> = entries.iter().map(|e| canonical_url_key(&e.url)).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), entries.len());
    }
}
