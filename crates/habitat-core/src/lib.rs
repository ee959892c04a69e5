//! Core content model and target schema for the Habitat migration pipeline.

mod model;
mod schema;

pub use model::*;
pub use schema::*;

pub const CRATE_NAME: &str = "habitat-core";

pub const META_DESCRIPTION_MAX_CHARS: usize = 160;

/// Page title stored on the experience row.
pub fn display_title(experience: &SourceExperience) -> String {
    format!(
        "{} Conservation in {}",
        experience.animal_name, experience.country_name
    )
}

/// Search snippet stored on the experience row, capped at
/// [`META_DESCRIPTION_MAX_CHARS`] characters.
pub fn meta_description(experience: &SourceExperience) -> String {
    let full = format!(
        "Volunteer with {} conservation projects in {}. {}",
        experience.animal_name.to_lowercase(),
        experience.country_name,
        experience.overview.trim()
    );
    truncate_chars(full.trim_end(), META_DESCRIPTION_MAX_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}
