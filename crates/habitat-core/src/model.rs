//! Denormalized source content: combined experiences and content hubs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ExperienceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

/// One country+animal content bundle, the unit of migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceExperience {
    pub country_slug: String,
    pub animal_slug: String,
    pub country_name: String,
    pub animal_name: String,
    #[serde(default)]
    pub status: ExperienceStatus,
    pub overview: String,
    #[serde(default)]
    pub conservation_context: String,
    #[serde(default)]
    pub best_time_to_visit: Option<String>,
    #[serde(default)]
    pub primary_threats: Vec<Threat>,
    #[serde(default)]
    pub seasonal_challenges: Vec<SeasonalChallenge>,
    pub unique_approach: UniqueApproach,
    #[serde(default)]
    pub related_experiences: RelatedExperiences,
    #[serde(default)]
    pub ecosystem_connections: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl SourceExperience {
    pub fn slug(&self) -> String {
        format!("{}-{}", self.country_slug, self.animal_slug)
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.country_slug, &self.animal_slug)
    }

    /// Child row counts a clean migration of this record must produce.
    pub fn expected_counts(&self) -> ExpectedCounts {
        ExpectedCounts {
            regional_threats: self.primary_threats.len() as u64,
            seasonal_challenges: self.seasonal_challenges.len() as u64,
            unique_approaches: 1,
            success_metrics: self.unique_approach.success_metrics.len() as u64,
            related_experiences: self.related_experiences.len() as u64,
            ecosystem_connections: self.ecosystem_connections.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExpectedCounts {
    pub regional_threats: u64,
    pub seasonal_challenges: u64,
    pub unique_approaches: u64,
    pub success_metrics: u64,
    pub related_experiences: u64,
    pub ecosystem_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threat {
    pub name: String,
    pub description: String,
    pub severity: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalChallenge {
    pub season: String,
    pub challenge: String,
    #[serde(default)]
    pub volunteer_impact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueApproach {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub success_metrics: Vec<SuccessMetric>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessMetric {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub timeframe: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelatedExperiences {
    #[serde(default)]
    pub same_animal_other_countries: Vec<RelatedLink>,
    #[serde(default)]
    pub same_country_other_animals: Vec<RelatedLink>,
    #[serde(default)]
    pub similar_conservation: Vec<RelatedLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedLink {
    pub country_slug: String,
    pub animal_slug: String,
    pub title: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedCategory {
    SameAnimalOtherCountries,
    SameCountryOtherAnimals,
    SimilarConservation,
}

impl RelatedCategory {
    pub const ALL: [RelatedCategory; 3] = [
        Self::SameAnimalOtherCountries,
        Self::SameCountryOtherAnimals,
        Self::SimilarConservation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameAnimalOtherCountries => "same_animal_other_countries",
            Self::SameCountryOtherAnimals => "same_country_other_animals",
            Self::SimilarConservation => "similar_conservation",
        }
    }
}

impl RelatedExperiences {
    pub fn category(&self, category: RelatedCategory) -> &[RelatedLink] {
        match category {
            RelatedCategory::SameAnimalOtherCountries => &self.same_animal_other_countries,
            RelatedCategory::SameCountryOtherAnimals => &self.same_country_other_animals,
            RelatedCategory::SimilarConservation => &self.similar_conservation,
        }
    }

    pub fn len(&self) -> usize {
        RelatedCategory::ALL
            .iter()
            .map(|c| self.category(*c).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every link with its category and its index inside that category.
    pub fn iter_categorized(&self) -> impl Iterator<Item = (RelatedCategory, usize, &RelatedLink)> {
        RelatedCategory::ALL.into_iter().flat_map(move |category| {
            self.category(category)
                .iter()
                .enumerate()
                .map(move |(index, link)| (category, index, link))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubKind {
    Animal,
    Country,
}

/// Animal or country landing content and the URLs it cites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHub {
    pub kind: HubKind,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}
