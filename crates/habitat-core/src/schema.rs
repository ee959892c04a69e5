//! Target relational schema: table graph, identifiers, and row shapes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-generated primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub Uuid);

impl RowId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier stamped on every row written by one migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub const RUN_ID_COLUMN: &str = "migration_run_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    CombinedExperiences,
    RegionalThreats,
    SeasonalChallenges,
    UniqueApproaches,
    SuccessMetrics,
    RelatedExperiences,
    EcosystemConnections,
    ContentSources,
    AnimalContentSources,
    CountryContentSources,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Self::CombinedExperiences,
        Self::RegionalThreats,
        Self::SeasonalChallenges,
        Self::UniqueApproaches,
        Self::SuccessMetrics,
        Self::RelatedExperiences,
        Self::EcosystemConnections,
        Self::ContentSources,
        Self::AnimalContentSources,
        Self::CountryContentSources,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CombinedExperiences => "combined_experiences",
            Self::RegionalThreats => "regional_threats",
            Self::SeasonalChallenges => "seasonal_challenges",
            Self::UniqueApproaches => "unique_approaches",
            Self::SuccessMetrics => "success_metrics",
            Self::RelatedExperiences => "related_experiences",
            Self::EcosystemConnections => "ecosystem_connections",
            Self::ContentSources => "content_sources",
            Self::AnimalContentSources => "animal_content_sources",
            Self::CountryContentSources => "country_content_sources",
        }
    }

    pub fn parent(self) -> Option<Table> {
        match self {
            Self::CombinedExperiences | Self::ContentSources => None,
            Self::RegionalThreats
            | Self::SeasonalChallenges
            | Self::UniqueApproaches
            | Self::RelatedExperiences
            | Self::EcosystemConnections => Some(Self::CombinedExperiences),
            Self::SuccessMetrics => Some(Self::UniqueApproaches),
            Self::AnimalContentSources | Self::CountryContentSources => Some(Self::ContentSources),
        }
    }

    /// Column holding the parent's id.
    pub fn foreign_key(self) -> Option<&'static str> {
        match self.parent()? {
            Self::CombinedExperiences => Some("experience_id"),
            Self::UniqueApproaches => Some("approach_id"),
            Self::ContentSources => Some("content_source_id"),
            _ => None,
        }
    }

    /// Distance from the root table of its dependency chain.
    pub fn depth(self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(parent) = current.parent() {
            depth += 1;
            current = parent;
        }
        depth
    }

    pub fn group(self) -> TableGroup {
        match self {
            Self::ContentSources | Self::AnimalContentSources | Self::CountryContentSources => {
                TableGroup::Sources
            }
            _ => TableGroup::Experiences,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tables written together by one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableGroup {
    Experiences,
    Sources,
}

impl TableGroup {
    pub fn tables(self) -> Vec<Table> {
        Table::ALL.into_iter().filter(|t| t.group() == self).collect()
    }

    /// Deepest tables first, so no row is deleted before the rows referencing it.
    pub fn rollback_order(self) -> Vec<Table> {
        let mut tables = self.tables();
        tables.sort_by_key(|t| std::cmp::Reverse(t.depth()));
        tables
    }
}

/// A child table counted from a parent row, optionally through its own children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub table: Table,
    pub nested: Vec<Relation>,
}

impl Relation {
    pub fn leaf(table: Table) -> Self {
        Self {
            table,
            nested: Vec::new(),
        }
    }

    pub fn with_nested(table: Table, nested: Vec<Relation>) -> Self {
        Self { table, nested }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperienceRow {
    pub country_slug: String,
    pub animal_slug: String,
    pub slug: String,
    pub country_name: String,
    pub animal_name: String,
    pub title: String,
    pub meta_description: String,
    pub overview: String,
    pub conservation_context: String,
    pub best_time_to_visit: Option<String>,
    pub status: String,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatRow {
    pub experience_id: RowId,
    pub name: String,
    pub description: String,
    pub severity: String,
    pub category: String,
    pub display_order: i32,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeRow {
    pub experience_id: RowId,
    pub season: String,
    pub challenge: String,
    pub volunteer_impact: String,
    pub display_order: i32,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproachRow {
    pub experience_id: RowId,
    pub title: String,
    pub description: String,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub approach_id: RowId,
    pub label: String,
    pub value: String,
    pub timeframe: Option<String>,
    pub display_order: i32,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedExperienceRow {
    pub experience_id: RowId,
    pub relationship_type: String,
    pub related_country_slug: String,
    pub related_animal_slug: String,
    pub title: String,
    pub reason: Option<String>,
    pub display_order: i32,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcosystemConnectionRow {
    pub experience_id: RowId,
    pub connection: String,
    pub display_order: i32,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Specialization {
    pub animals: Vec<String>,
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Government,
    Academic,
    Research,
    Organization,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::Academic => "academic",
            Self::Research => "research",
            Self::Organization => "organization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentSourceRow {
    pub url: String,
    pub organization_name: String,
    pub source_type: SourceType,
    pub credibility_score: u8,
    pub specialization: Specialization,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimalSourceLinkRow {
    pub animal_slug: String,
    pub content_source_id: RowId,
    pub relevance_score: u8,
    pub notes: String,
    pub migration_run_id: RunId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountrySourceLinkRow {
    pub country_slug: String,
    pub content_source_id: RowId,
    pub relevance_score: u8,
    pub notes: String,
    pub migration_run_id: RunId,
}

/// Serialize a typed row into the JSON object handed to a store.
pub fn to_row<T: Serialize>(row: &T) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(row)
}

/// `display_order` for the item at `index` of its source array.
pub fn display_order(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}
