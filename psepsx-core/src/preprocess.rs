use regex::bytes::{NoExpand, Regex};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::options::BuildOption;
use crate::{BuildError, Result};

/// Replaces option patterns in text assets with `1` (enabled) or `0`.
///
/// Patterns are compiled once up front, in option order. That order is the
/// substitution order, so a later option rewrites what an earlier one left.
pub struct Preprocessor {
    rules: Vec<(Regex, &'static str)>,
    extensions: Vec<String>,
}

impl Preprocessor {
    pub fn new(options: &[BuildOption], extensions: &[String]) -> Result<Self> {
        let mut rules = Vec::new();
        for option in options {
            let Some(pattern) = option.pattern() else {
                continue;
            };
            let regex = Regex::new(pattern).map_err(|e| BuildError::Pattern {
                pattern: pattern.to_string(),
                source: e,
            })?;
            rules.push((regex, option.replacement()));
        }

        let extensions = extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Ok(Self { rules, extensions })
    }

    pub fn is_text_asset(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }

    /// Text assets under `root`, sorted for a stable processing order.
    pub fn text_assets(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                BuildError::io(path, e.into())
            })?;
            if entry.file_type().is_file() && self.is_text_asset(entry.path()) {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    pub fn apply(&self, text: &[u8]) -> Vec<u8> {
        let mut current = text.to_vec();
        for (regex, replacement) in &self.rules {
            current = regex.replace_all(&current, NoExpand(replacement.as_bytes())).into_owned();
        }
        current
    }

    /// Rewrite one file in full. Returns whether the contents changed.
    pub fn process_file(&self, path: &Path) -> Result<bool> {
        let original = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        let processed = self.apply(&original);
        fs::write(path, &processed).map_err(|e| BuildError::io(path, e))?;
        let changed = processed != original;
        debug!("Preprocessed {} (changed: {})", path.display(), changed);
        Ok(changed)
    }

    pub fn process_tree(&self, root: &Path) -> Result<usize> {
        let files = self.text_assets(root)?;
        for file in &files {
            self.process_file(file)?;
        }
        Ok(files.len())
    }
}
