//! Collapse every cited URL across the corpus into one content source each.

use std::collections::HashMap;

use habitat_core::{ContentHub, HubKind, SourceExperience, SourceType, Specialization};
use serde::Serialize;

use crate::classify::{canonical_url_key, display_url, ClassificationRules};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentSourceEntry {
    pub url: String,
    pub organization_name: String,
    pub source_type: SourceType,
    pub credibility_score: u8,
    pub specialization: Specialization,
    pub citations: u32,
}

/// Caller-owned accumulation context keyed by canonical URL.
#[derive(Debug, Clone)]
pub struct SourceAggregation<'r> {
    rules: &'r ClassificationRules,
    entries: Vec<ContentSourceEntry>,
    index: HashMap<String, usize>,
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

impl<'r> SourceAggregation<'r> {
    pub fn new(rules: &'r ClassificationRules) -> Self {
        Self {
            rules,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Record one citation of `url` for the given animal and/or country.
    pub fn cite(&mut self, url: &str, animal: Option<&str>, country: Option<&str>) {
        if url.trim().is_empty() {
            return;
        }
        let key = canonical_url_key(url);
        let position = match self.index.get(&key).copied() {
            Some(position) => position,
            None => {
                let url = display_url(url);
                self.entries.push(ContentSourceEntry {
                    organization_name: self.rules.organization_name(&url),
                    source_type: self.rules.source_type(&url),
                    credibility_score: self.rules.credibility_score(&url),
                    url,
                    specialization: Specialization::default(),
                    citations: 0,
                });
                self.index.insert(key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[position];
        entry.citations += 1;
        if let Some(animal) = animal {
            push_unique(&mut entry.specialization.animals, animal);
        }
        if let Some(country) = country {
            push_unique(&mut entry.specialization.countries, country);
        }
    }

    pub fn aggregate_hub(&mut self, hub: &ContentHub) {
        let (animal, country) = match hub.kind {
            HubKind::Animal => (Some(hub.slug.as_str()), None),
            HubKind::Country => (None, Some(hub.slug.as_str())),
        };
        for url in &hub.sources {
            self.cite(url, animal, country);
        }
    }

    pub fn aggregate_experience(&mut self, experience: &SourceExperience) {
        for url in &experience.sources {
            self.cite(
                url,
                Some(&experience.animal_slug),
                Some(&experience.country_slug),
            );
        }
    }

    pub fn get(&self, url: &str) -> Option<&ContentSourceEntry> {
        self.index
            .get(&canonical_url_key(url))
            .map(|position| &self.entries[*position])
    }

    pub fn entries(&self) -> &[ContentSourceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in first-seen order.
    pub fn into_entries(self) -> Vec<ContentSourceEntry> {
        self.entries
    }
}

/// Content hubs first, then combined experiences.
pub fn aggregate_corpus(
    hubs: &[ContentHub],
    experiences: &[SourceExperience],
    rules: &ClassificationRules,
) -> Vec<ContentSourceEntry> {
    let mut aggregation = SourceAggregation::new(rules);
    for hub in hubs {
        aggregation.aggregate_hub(hub);
    }
    for experience in experiences {
        aggregation.aggregate_experience(experience);
    }
    aggregation.into_entries()
}
