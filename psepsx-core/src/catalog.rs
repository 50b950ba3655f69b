//! The option catalog: a JSON list of option descriptors shipped with the
//! tool, plus the per-user enabled toggles that turn it into build options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::options::BuildOption;
use crate::{BuildError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text(String),
    /// Rendered fragments; the first one doubles as the summary.
    Lines(Vec<String>),
}

impl Default for Description {
    fn default() -> Self {
        Description::Text(String::new())
    }
}

impl Description {
    pub fn short(&self) -> &str {
        match self {
            Description::Text(text) => text,
            Description::Lines(lines) => lines
                .first()
                .map(|first| first.strip_suffix("<br>").unwrap_or(first))
                .unwrap_or(""),
        }
    }

    pub fn long(&self) -> String {
        match self {
            Description::Text(text) => text.clone(),
            Description::Lines(lines) => lines.concat(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionDescriptor {
    pub id: String,
    pub name: String,
    pub category: String,
    pub description: Description,
    /// Preprocessing pattern; empty for options without a text effect.
    pub definition: String,
    #[serde(alias = "transform")]
    pub script: String,
}

impl OptionDescriptor {
    pub fn short_description(&self) -> &str {
        self.description.short()
    }

    pub fn long_description(&self) -> String {
        self.description.long()
    }

    pub fn build_option(&self, enabled: bool) -> BuildOption {
        BuildOption::new(self.id.clone(), enabled)
            .with_pattern(self.definition.clone())
            .with_transform(self.script.clone())
    }
}

pub fn parse_catalog(text: &str) -> serde_json::Result<Vec<OptionDescriptor>> {
    serde_json::from_str(text)
}

pub fn load_catalog(path: &Path) -> Result<Vec<OptionDescriptor>> {
    let text = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    parse_catalog(&text).map_err(|e| BuildError::Catalog {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Descriptors grouped by category, categories in first-seen order.
pub fn categories(descriptors: &[OptionDescriptor]) -> Vec<(&str, Vec<&OptionDescriptor>)> {
    let mut groups: Vec<(&str, Vec<&OptionDescriptor>)> = Vec::new();
    for descriptor in descriptors {
        match groups.iter_mut().find(|(name, _)| *name == descriptor.category) {
            Some((_, members)) => members.push(descriptor),
            None => groups.push((descriptor.category.as_str(), vec![descriptor])),
        }
    }
    groups
}

/// Build options in catalog order. Options missing from `toggles` are enabled.
pub fn build_options(
    descriptors: &[OptionDescriptor],
    toggles: &HashMap<String, bool>,
) -> Vec<BuildOption> {
    descriptors
        .iter()
        .map(|d| d.build_option(toggles.get(&d.id).copied().unwrap_or(true)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG: &str = r#"[
        {
            "id": "NoHUDScarabs",
            "name": "No HUD scarabs",
            "category": "HUD",
            "description": ["Hides the scarabs.<br>", "They are <i>distracting</i>."],
            "definition": "NO_HUD_SCARABS",
            "script": "NoHUDScarabs"
        },
        {
            "id": "FastDoors",
            "name": "Fast doors",
            "category": "Gameplay",
            "description": "Doors open faster.",
            "definition": "FAST_DOORS"
        },
        {
            "id": "HUDHeads",
            "category": "HUD",
            "transform": "HUDHeads"
        }
    ]"#;

    #[test]
    fn parse_catalog_defaults_missing_fields() {
        let catalog = parse_catalog(CATALOG).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog[1].script, "");
        assert_eq!(catalog[2].name, "");
        assert_eq!(catalog[2].definition, "");
        assert_eq!(catalog[2].script, "HUDHeads");
    }

    #[test]
    fn short_and_long_descriptions() {
        let catalog = parse_catalog(CATALOG).unwrap();
        assert_eq!(catalog[0].short_description(), "Hides the scarabs.");
        assert_eq!(
            catalog[0].long_description(),
            "Hides the scarabs.<br>They are <i>distracting</i>."
        );
        assert_eq!(catalog[1].short_description(), "Doors open faster.");
        assert_eq!(catalog[1].long_description(), "Doors open faster.");
        assert_eq!(catalog[2].short_description(), "");
    }

    #[test]
    fn categories_keep_first_seen_order() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let groups = categories(&catalog);
        let names: Vec<_> = groups.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["HUD", "Gameplay"]);
        let hud: Vec<_> = groups[0].1.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(hud, vec!["NoHUDScarabs", "HUDHeads"]);
    }

    #[test]
    fn build_options_from_toggles() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let toggles = HashMap::from([("FastDoors".to_string(), false)]);
        let options = build_options(&catalog, &toggles);

        assert_eq!(options.len(), 3);
        assert!(options[0].enabled);
        assert_eq!(options[0].pattern(), Some("NO_HUD_SCARABS"));
        assert_eq!(options[0].active_transform(), Some("NoHUDScarabs"));
        assert!(!options[1].enabled);
        assert_eq!(options[1].active_transform(), None);
        assert_eq!(options[2].pattern(), None);
        assert_eq!(options[2].active_transform(), Some("HUDHeads"));
    }

    #[test]
    fn load_catalog_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Mods.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_catalog(&path).unwrap_err();
        assert!(matches!(err, BuildError::Catalog { path: p, .. } if p == path));
    }
}
