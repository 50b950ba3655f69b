use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One build toggle, in the order the caller wants it applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOption {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Preprocessing pattern. When absent the id is the pattern; an empty
    /// string means the option has no text effect.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, alias = "script")]
    pub transform: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl BuildOption {
    pub fn new(id: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            enabled,
            pattern: None,
            transform: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_transform(mut self, name: impl Into<String>) -> Self {
        self.transform = Some(name.into());
        self
    }

    /// The regex searched for in text assets, if any.
    pub fn pattern(&self) -> Option<&str> {
        let pattern = self.pattern.as_deref().unwrap_or(&self.id);
        (!pattern.is_empty()).then_some(pattern)
    }

    /// The transform to run, if the option is enabled and names one.
    pub fn active_transform(&self) -> Option<&str> {
        match self.transform.as_deref() {
            Some(name) if self.enabled && !name.is_empty() => Some(name),
            _ => None,
        }
    }

    pub(crate) fn replacement(&self) -> &'static str {
        if self.enabled {
            "1"
        } else {
            "0"
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    pub archive_path: PathBuf,
    /// Applied strictly in this order.
    #[serde(default)]
    pub diff_files: Vec<PathBuf>,
    #[serde(default)]
    pub overlay_dir: Option<PathBuf>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub options: Vec<BuildOption>,
    /// 8 hex digit CRC-32 of the reference archive. Validation is skipped
    /// when unset.
    #[serde(default)]
    pub expected_checksum: Option<String>,
    /// Parent directory for the scratch working tree; the system temp
    /// directory when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
}

pub fn default_text_extensions() -> Vec<String> {
    vec!["txt".to_string()]
}

impl BuildSettings {
    pub fn new(archive_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            diff_files: Vec::new(),
            overlay_dir: None,
            output_path: output_path.into(),
            options: Vec::new(),
            expected_checksum: None,
            work_dir: None,
            text_extensions: default_text_extensions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_doubles_as_pattern() {
        let option = BuildOption::new("NO_HUD_SCARABS", true);
        assert_eq!(option.pattern(), Some("NO_HUD_SCARABS"));
    }

    #[test]
    fn empty_pattern_disables_text_effect() {
        let option = BuildOption::new("HUD_HEADS", true).with_pattern("");
        assert_eq!(option.pattern(), None);
    }

    #[test]
    fn transform_only_runs_when_enabled() {
        let enabled = BuildOption::new("a", true).with_transform("HUDHeads");
        let disabled = BuildOption::new("b", false).with_transform("HUDHeads");
        let unnamed = BuildOption::new("c", true).with_transform("");
        assert_eq!(enabled.active_transform(), Some("HUDHeads"));
        assert_eq!(disabled.active_transform(), None);
        assert_eq!(unnamed.active_transform(), None);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let option: BuildOption = serde_json::from_str(r#"{"id": "X", "script": "NoHUDScarabs"}"#).unwrap();
        assert!(option.enabled);
        assert_eq!(option.pattern, None);
        assert_eq!(option.transform.as_deref(), Some("NoHUDScarabs"));

        let settings: BuildSettings =
            serde_json::from_str(r#"{"archive_path": "game.kpf", "output_path": "out.kpf"}"#).unwrap();
        assert!(settings.diff_files.is_empty());
        assert_eq!(settings.text_extensions, vec!["txt".to_string()]);
    }
}
