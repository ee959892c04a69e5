//! URL identity and classification: organization name, source type, credibility.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use habitat_core::SourceType;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

pub const UNKNOWN_SOURCE: &str = "Unknown Source";

/// First rule whose markers appear in the lowercased URL decides the result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RankedRules<T> {
    pub rules: Vec<RankedRule<T>>,
    pub fallback: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RankedRule<T> {
    pub result: T,
    pub contains_any: Vec<String>,
}

impl<T: Copy> RankedRules<T> {
    pub fn classify(&self, url: &str) -> T {
        let lowered = url.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| lowered.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.result)
            .unwrap_or(self.fallback)
    }
}

fn rule<T>(result: T, markers: &[&str]) -> RankedRule<T> {
    RankedRule {
        result,
        contains_any: markers.iter().map(|m| m.to_string()).collect(),
    }
}

pub fn default_source_type_rules() -> RankedRules<SourceType> {
    RankedRules {
        rules: vec![
            rule(
                SourceType::Government,
                &[".gov", "kws.go.ke", "sanparks.org", "parks.go."],
            ),
            rule(SourceType::Academic, &[".edu", ".ac.", "research", "academic"]),
            rule(SourceType::Research, &["iucn", "research", "study"]),
        ],
        fallback: SourceType::Organization,
    }
}

pub fn default_credibility_rules() -> RankedRules<u8> {
    RankedRules {
        rules: vec![
            rule(
                95,
                &[
                    "iucn.org",
                    "iucnredlist.org",
                    "worldwildlife.org",
                    "wwf.panda.org",
                    "panthera.org",
                    "wcs.org",
                    "kws.go.ke",
                    "cites.org",
                    "nationalgeographic.com",
                ],
            ),
            rule(90, &[".gov"]),
            rule(88, &[".edu", ".ac."]),
            rule(
                85,
                &["conservation", "conservancy", "wildlife", "wwf", "savethe", "trust"],
            ),
        ],
        fallback: 80,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationDirectory {
    names: BTreeMap<String, String>,
}

impl Default for OrganizationDirectory {
    fn default() -> Self {
        let names = [
            ("worldwildlife.org", "World Wildlife Fund"),
            ("wwf.panda.org", "WWF International"),
            ("panthera.org", "Panthera"),
            ("iucn.org", "IUCN"),
            ("iucnredlist.org", "IUCN Red List"),
            ("kws.go.ke", "Kenya Wildlife Service"),
            ("sanparks.org", "South African National Parks"),
            ("nationalgeographic.com", "National Geographic"),
            ("wcs.org", "Wildlife Conservation Society"),
            ("savetheelephants.org", "Save the Elephants"),
            ("seaturtleconservancy.org", "Sea Turtle Conservancy"),
            ("conservation.org", "Conservation International"),
            ("fauna-flora.org", "Fauna & Flora"),
            ("janegoodall.org", "Jane Goodall Institute"),
            ("orangutan.org", "Orangutan Foundation International"),
            ("cites.org", "CITES"),
            ("unep.org", "UN Environment Programme"),
            ("fws.gov", "U.S. Fish & Wildlife Service"),
            ("noaa.gov", "NOAA"),
            ("awf.org", "African Wildlife Foundation"),
            ("savetherhino.org", "Save the Rhino International"),
            ("zsl.org", "Zoological Society of London"),
            ("oceanconservancy.org", "Ocean Conservancy"),
            ("wildaid.org", "WildAid"),
            ("defenders.org", "Defenders of Wildlife"),
            ("rainforest-alliance.org", "Rainforest Alliance"),
        ]
        .into_iter()
        .map(|(domain, name)| (domain.to_string(), name.to_string()))
        .collect();
        Self { names }
    }
}

impl OrganizationDirectory {
    pub fn empty() -> Self {
        Self {
            names: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, domain: &str, name: &str) {
        self.names
            .insert(bare_host(&domain.to_lowercase()).to_string(), name.to_string());
    }

    pub fn lookup(&self, host: &str) -> Option<&str> {
        self.names.get(host).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn bare_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

#[derive(Debug, Clone, Deserialize)]
struct OrganizationsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    extend_builtin: bool,
    #[serde(default)]
    organizations: Vec<OrganizationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrganizationEntry {
    domain: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile<T> {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    rules: RankedRules<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRules {
    pub organizations: OrganizationDirectory,
    pub source_types: RankedRules<SourceType>,
    pub credibility: RankedRules<u8>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            organizations: OrganizationDirectory::default(),
            source_types: default_source_type_rules(),
            credibility: default_credibility_rules(),
        }
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        debug!(path = %path.display(), "rules file absent, using built-in rules");
        return Ok(None);
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text)
        .map(Some)
        .with_context(|| format!("parsing {}", path.display()))
}

impl ClassificationRules {
    pub fn from_rules_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut rules = Self::default();

        if let Some(file) = read_yaml::<OrganizationsFile>(&dir.join("organizations.yaml"))? {
            if !file.extend_builtin {
                rules.organizations = OrganizationDirectory::empty();
            }
            for entry in file.organizations {
                rules.organizations.insert(&entry.domain, &entry.name);
            }
        }
        if let Some(file) = read_yaml::<RulesFile<SourceType>>(&dir.join("source_types.yaml"))? {
            rules.source_types = file.rules;
        }
        if let Some(file) = read_yaml::<RulesFile<u8>>(&dir.join("credibility.yaml"))? {
            rules.credibility = file.rules;
        }
        Ok(rules)
    }

    pub fn organization_name(&self, url: &str) -> String {
        extract_organization_name(url, &self.organizations)
    }

    pub fn source_type(&self, url: &str) -> SourceType {
        determine_source_type(url, &self.source_types)
    }

    pub fn credibility_score(&self, url: &str) -> u8 {
        generate_credibility_score(url, &self.credibility)
    }
}

/// Publisher name for `url`: directory entry, else first hostname label,
/// else [`UNKNOWN_SOURCE`] when the URL does not parse.
pub fn extract_organization_name(url: &str, directory: &OrganizationDirectory) -> String {
    let Some(host) = Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return UNKNOWN_SOURCE.to_string();
    };
    let host = bare_host(&host);
    if let Some(name) = directory.lookup(host) {
        return name.to_string();
    }
    match host.split('.').next() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => UNKNOWN_SOURCE.to_string(),
    }
}

pub fn determine_source_type(url: &str, rules: &RankedRules<SourceType>) -> SourceType {
    rules.classify(url)
}

pub fn generate_credibility_score(url: &str, rules: &RankedRules<u8>) -> u8 {
    rules.classify(url).min(100)
}

pub fn canonical_url_key(url: &str) -> String {
    display_url(url).to_lowercase()
}

pub fn display_url(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let text = parsed.to_string();
            if parsed.path() == "/" && parsed.query().is_none() {
                text.trim_end_matches('/').to_string()
            } else {
                text
            }
        }
        Err(_) => trimmed
            .split('#')
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn organization_names_come_from_directory_then_hostname() {
        let dir = OrganizationDirectory::default();
        assert_eq!(
            extract_organization_name("https://www.panthera.org/cat/lion", &dir),
            "Panthera"
        );
        assert_eq!(
            extract_organization_name("https://example.org/page", &dir),
            "example"
        );
        assert_eq!(extract_organization_name("not a url", &dir), UNKNOWN_SOURCE);
        assert!(dir.len() >= 25);
    }

    #[test]
    fn government_markers_win_over_research_keywords() {
        let rules = default_source_type_rules();
        assert_eq!(
            determine_source_type("https://www.kws.go.ke/about", &rules),
            SourceType::Government
        );
        assert_eq!(
            determine_source_type("https://research.noaa.gov/turtles", &rules),
            SourceType::Government
        );
        assert_eq!(
            determine_source_type("https://zoology.ox.ac.uk/study", &rules),
            SourceType::Academic
        );
        assert_eq!(
            determine_source_type("https://www.iucnredlist.org/species/15951", &rules),
            SourceType::Research
        );
        assert_eq!(
            determine_source_type("https://www.panthera.org", &rules),
            SourceType::Organization
        );
    }

    #[test]
    fn credibility_tiers_stop_at_first_match() {
        let rules = default_credibility_rules();
        // Authoritative and conservation keyword both present: first tier wins.
        assert_eq!(
            generate_credibility_score("https://www.worldwildlife.org/species", &rules),
            95
        );
        assert_eq!(generate_credibility_score("https://www.fws.gov/", &rules), 90);
        assert_eq!(
            generate_credibility_score("https://www.wildlife.cam.ac.uk/", &rules),
            88
        );
        assert_eq!(
            generate_credibility_score("https://www.savetherhino.org/", &rules),
            85
        );
        assert_eq!(generate_credibility_score("https://example.org", &rules), 80);
    }

    #[test]
    fn classification_is_repeatable() {
        let rules = ClassificationRules::default();
        let url = "https://www.kws.go.ke/about";
        assert_eq!(rules.source_type(url), rules.source_type(url));
        assert_eq!(rules.credibility_score(url), rules.credibility_score(url));
        assert_eq!(rules.organization_name(url), rules.organization_name(url));
        assert_eq!(rules.source_type(url), SourceType::Government);
    }

    #[test]
    fn canonical_keys_ignore_case_and_fragments() {
        assert_eq!(
            canonical_url_key("https://WWW.Panthera.org/#lions"),
            canonical_url_key("https://www.panthera.org")
        );
        assert_eq!(
            canonical_url_key("https://www.panthera.org/Cats#top"),
            "https://www.panthera.org/cats"
        );
        assert_eq!(display_url("https://www.panthera.org/"), "https://www.panthera.org");
        assert_eq!(canonical_url_key("not a url#frag"), "not a url");
    }

    #[test]
    fn rules_dir_overrides_only_present_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("organizations.yaml"),
            "version: 1\nextend_builtin: true\norganizations:\n  - domain: www.example.org\n    name: Example Trust\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("credibility.yaml"),
            "version: 1\nrules:\n  - result: 70\n    contains_any: [example]\nfallback: 50\n",
        )
        .unwrap();

        let rules = ClassificationRules::from_rules_dir(dir.path()).expect("rules");
        assert_eq!(rules.organization_name("https://example.org"), "Example Trust");
        assert_eq!(rules.organization_name("https://panthera.org"), "Panthera");
        assert_eq!(rules.credibility_score("https://example.org"), 70);
        assert_eq!(rules.credibility_score("https://panthera.org"), 50);
        assert_eq!(rules.source_types, default_source_type_rules());
    }
}
