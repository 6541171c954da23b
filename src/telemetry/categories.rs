//! Process-wide default trace categories.
//!
//! A broker's announce response may carry a JSON-encoded category set the
//! connecting process should adopt as its default diagnostic
//! configuration. Two shapes are accepted:
//!
//! ```json
//! ["Information", "Error"]
//! [{"category": "Information", "enabled": true}]
//! ```
//!
//! Enabled categories become env-filter directives (`<category>=trace`)
//! that [`super::logging::init_logging`] folds into its filter. The stored
//! default is process-wide because the tracing subscriber itself is.

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

static DEFAULT_CATEGORIES: RwLock<Option<String>> = RwLock::new(None);

#[derive(Error, Debug)]
pub enum CategoryError {
    #[error("Invalid category JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("No enabled categories in set")]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CategoryEntry {
    Flagged { category: String, enabled: bool },
    Name(String),
}

/// Translate a category set into an env-filter directive string.
pub fn filter_from_categories(json: &str) -> Result<String, CategoryError> {
    let entries: Vec<CategoryEntry> = serde_json::from_str(json)?;

    let directives: Vec<String> = entries
        .into_iter()
        .filter_map(|entry| match entry {
            CategoryEntry::Name(category) => Some(category),
            CategoryEntry::Flagged { category, enabled } => enabled.then_some(category),
        })
        .map(|category| format!("{}=trace", category))
        .collect();

    if directives.is_empty() {
        return Err(CategoryError::Empty);
    }
    Ok(directives.join(","))
}

/// Adopt a category set as the process-wide default.
///
/// Called from the announce dispatch path; the stored filter applies to
/// subscribers initialized afterwards.
pub fn set_default_categories_json(json: &str) -> Result<(), CategoryError> {
    let filter = filter_from_categories(json)?;
    info!(%filter, "adopted default trace categories");
    *DEFAULT_CATEGORIES.write() = Some(filter);
    Ok(())
}

/// The currently adopted default filter, if any.
pub fn default_categories_filter() -> Option<String> {
    DEFAULT_CATEGORIES.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_plain_names() {
        let filter = filter_from_categories(r#"["Information","Error"]"#).unwrap();
        assert_eq!(filter, "Information=trace,Error=trace");
    }

    #[test]
    fn test_filter_from_flagged_entries() {
        let json = r#"[
            {"category": "Information", "enabled": true},
            {"category": "Noise", "enabled": false}
        ]"#;
        let filter = filter_from_categories(json).unwrap();
        assert_eq!(filter, "Information=trace");
    }

    #[test]
    fn test_all_disabled_is_empty() {
        let json = r#"[{"category": "Noise", "enabled": false}]"#;
        assert!(matches!(
            filter_from_categories(json),
            Err(CategoryError::Empty)
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            filter_from_categories("not json"),
            Err(CategoryError::InvalidJson(_))
        ));
    }
}
