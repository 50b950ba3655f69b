//! Build pipeline for PSEPSX-style patch packages.
//!
//! A build takes a read-only reference archive (the game's `.kpf`), an
//! ordered list of unified diffs, an optional directory of verbatim
//! overlay files and an ordered list of build options, and produces a
//! single installable archive:
//!
//! 1. every diff is applied against originals extracted from the archive
//! 2. overlay files are copied over the result
//! 3. text assets have option patterns replaced with `1`/`0`
//! 4. enabled options with a transform derive binary assets
//! 5. the working tree is packed into the output archive
//!
//! See [`build::run`] for the entry point.

use std::path::PathBuf;
use thiserror::Error;

pub mod archive;
pub mod build;
pub mod catalog;
pub mod diff;
pub mod options;
pub mod package;
pub mod patch;
pub mod preprocess;
pub mod transform;

pub use archive::{checksum, verify_checksum, MemberSource, ReferenceArchive};
pub use build::{
    run, run_per_diff, run_with_status, spawn, BuildEvent, BuildHandle, BuildReport, BuildStage,
    BuildStatus, WorkingTree,
};
pub use catalog::{
    build_options, categories, load_catalog, parse_catalog, Description, OptionDescriptor,
};
pub use diff::{collect_diff_files, parse_diff, read_diff_file, DiffFile, EditItem, EditKind, Hunk};
pub use options::{BuildOption, BuildSettings};
pub use transform::{BlankAsset, FlipAsset, Transform, TransformRegistry};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("reference archive checksum mismatch: expected {expected}, got {actual}")]
    ArchiveMismatch { expected: String, actual: String },

    #[error("archive member not found: {member}")]
    NotFound { member: String },

    #[error("malformed hunk in {diff} ({path}) on line {line}: {reason}")]
    MalformedHunk {
        diff: String,
        path: String,
        line: usize,
        reason: String,
    },

    #[error("hunk #{hunk} of {diff} does not apply to {path} (expected near line {line})")]
    HunkMismatch {
        diff: String,
        path: String,
        hunk: usize,
        line: usize,
    },

    #[error("unknown transform '{name}'")]
    UnknownTransform { name: String },

    #[error("path escapes the working tree: {path}")]
    UnsafePath { path: String },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error at {}: {source}", path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("image error in {member}: {source}")]
    Image {
        member: String,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid option pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to parse option catalog {}: {source}", path.display())]
    Catalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Join a forward-slash relative path onto `base`, refusing anything that
/// would land outside of it.
pub(crate) fn join_relative(base: &std::path::Path, relative: &str) -> Result<PathBuf> {
    let mut path = base.to_path_buf();
    let mut pushed = false;
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                return Err(BuildError::UnsafePath {
                    path: relative.to_string(),
                })
            }
            _ => {
                path.push(part);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(BuildError::UnsafePath {
            path: relative.to_string(),
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn join_relative_splits_on_both_separators() {
        let joined = join_relative(Path::new("/tmp/root"), "gfx\\hud/scarab.png").unwrap();
        assert_eq!(joined, Path::new("/tmp/root/gfx/hud/scarab.png"));
    }

    #[test]
    fn join_relative_rejects_parent_components() {
        let err = join_relative(Path::new("/tmp/root"), "gfx/../../etc/passwd").unwrap_err();
        assert!(matches!(err, BuildError::UnsafePath { .. }));
    }

    #[test]
    fn join_relative_rejects_empty_paths() {
        assert!(join_relative(Path::new("/tmp/root"), "/./").is_err());
    }
}
