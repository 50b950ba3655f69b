//! Applying parsed diffs to the working tree.
//!
//! A diff is applied in two passes, like a patch set: first every item is
//! materialized (created, deleted, or its original extracted from the
//! reference archive when the working tree does not hold it yet), then
//! the hunks of every patch item are applied in place.

use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::archive::ReferenceArchive;
use crate::diff::{DiffFile, EditItem, EditKind, Hunk, HunkLine};
use crate::{join_relative, BuildError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub created: usize,
    pub deleted: usize,
    pub extracted: usize,
    pub patched: usize,
}

pub fn apply_diff(diff: &DiffFile, archive: &ReferenceArchive, root: &Path) -> Result<PatchSummary> {
    let mut summary = PatchSummary::default();

    for item in &diff.items {
        match item.kind() {
            EditKind::Create => {
                create_file(diff, item, root)?;
                summary.created += 1;
            }
            EditKind::Delete => {
                if delete_file(item, root)? {
                    summary.deleted += 1;
                }
            }
            EditKind::Patch => {
                if populate_original(item, archive, root)? {
                    summary.extracted += 1;
                }
            }
        }
    }

    for item in diff.items.iter().filter(|item| item.kind() == EditKind::Patch) {
        patch_file(diff, item, root)?;
        summary.patched += 1;
    }

    Ok(summary)
}

fn create_file(diff: &DiffFile, item: &EditItem, root: &Path) -> Result<()> {
    let target = item.target.as_deref().unwrap_or_default();
    let dest = join_relative(root, target)?;
    info!("Creating {}...", dest.display());

    let mut contents = String::new();
    for hunk in &item.hunks {
        for (offset, line) in hunk.lines.iter().enumerate() {
            match line {
                HunkLine::Added(text) => {
                    contents.push_str(text);
                    contents.push('\n');
                }
                _ => {
                    return Err(BuildError::MalformedHunk {
                        diff: diff.name.clone(),
                        path: target.to_string(),
                        line: hunk.header_line + offset + 1,
                        reason: "new file hunk contains a line that is not an addition".to_string(),
                    });
                }
            }
        }
    }

    write_file(&dest, contents.as_bytes())
}

fn delete_file(item: &EditItem, root: &Path) -> Result<bool> {
    let source = item.source.as_deref().unwrap_or_default();
    let path = join_relative(root, source)?;
    if !path.is_file() {
        debug!("{} already absent", path.display());
        return Ok(false);
    }
    info!("Removing {}...", path.display());
    fs::remove_file(&path).map_err(|e| BuildError::io(&path, e))?;
    Ok(true)
}

/// Extract the original unless an earlier step already put a copy at the
/// destination; a source missing from the archive is left to whatever the
/// working tree holds.
fn populate_original(item: &EditItem, archive: &ReferenceArchive, root: &Path) -> Result<bool> {
    let source = item.source.as_deref().unwrap_or_default();
    let dest = join_relative(root, item.target.as_deref().unwrap_or_default())?;
    if dest.exists() || !archive.exists(source) {
        return Ok(false);
    }
    info!("Extracting {}...", source);
    archive.extract_to(source, &dest)?;
    Ok(true)
}

fn patch_file(diff: &DiffFile, item: &EditItem, root: &Path) -> Result<()> {
    let target = item.target.as_deref().unwrap_or_default();
    let dest = join_relative(root, target)?;
    if !dest.is_file() {
        return Err(BuildError::NotFound {
            member: item.source.clone().unwrap_or_default(),
        });
    }

    let original = fs::read(&dest).map_err(|e| BuildError::io(&dest, e))?;
    let mut file = TextFile::parse(&original);
    file.apply_hunks(&item.hunks).map_err(|(hunk, line)| BuildError::HunkMismatch {
        diff: diff.name.clone(),
        path: target.to_string(),
        hunk,
        line,
    })?;
    debug!("Patched {} ({} hunks)", dest.display(), item.hunks.len());
    write_file(&dest, &file.to_bytes())
}

fn write_file(dest: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    fs::write(dest, contents).map_err(|e| BuildError::io(dest, e))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    text: Vec<u8>,
    eol: &'static [u8],
}

impl Line {
    fn matches(&self, expected: &str) -> bool {
        let text = self.text.strip_suffix(b"\r").unwrap_or(&self.text);
        let expected = expected.as_bytes();
        text == expected.strip_suffix(b"\r").unwrap_or(expected)
    }
}

struct TextFile {
    lines: Vec<Line>,
    eol: &'static [u8],
}

impl TextFile {
    fn parse(raw: &[u8]) -> Self {
        let mut lines = Vec::new();
        let mut rest = raw;
        while !rest.is_empty() {
            match rest.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    let (text, eol): (&[u8], &'static [u8]) =
                        if idx > 0 && rest[idx - 1] == b'\r' {
                            (&rest[..idx - 1], b"\r\n")
                        } else {
                            (&rest[..idx], b"\n")
                        };
                    lines.push(Line {
                        text: text.to_vec(),
                        eol,
                    });
                    rest = &rest[idx + 1..];
                }
                None => {
                    lines.push(Line {
                        text: rest.to_vec(),
                        eol: b"",
                    });
                    rest = &[];
                }
            }
        }

        let eol: &'static [u8] = match lines.first() {
            Some(line) if line.eol == b"\r\n" => b"\r\n",
            _ => b"\n",
        };
        Self { lines, eol }
    }

    /// On failure returns the 1-based hunk number and the line it was
    /// expected at.
    fn apply_hunks(&mut self, hunks: &[Hunk]) -> std::result::Result<(), (usize, usize)> {
        let mut delta: isize = 0;
        let mut floor = 0usize;

        for (index, hunk) in hunks.iter().enumerate() {
            let before: Vec<&str> = hunk.before().collect();
            let anchor = if hunk.source_len == 0 {
                hunk.source_start
            } else {
                hunk.source_start.saturating_sub(1)
            };
            let expected = (anchor as isize + delta).max(0) as usize;

            let pos = self
                .locate(&before, expected, floor)
                .ok_or((index + 1, hunk.source_start))?;

            let mut replacement = Vec::with_capacity(hunk.lines.len());
            let mut cursor = pos;
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(_) => {
                        replacement.push(self.lines[cursor].clone());
                        cursor += 1;
                    }
                    HunkLine::Removed(_) => cursor += 1,
                    HunkLine::Added(text) => replacement.push(Line {
                        text: text.as_bytes().to_vec(),
                        eol: self.eol,
                    }),
                }
            }

            if !replacement.is_empty() && pos > 0 && self.lines[pos - 1].eol.is_empty() {
                // Appending after an unterminated last line.
                self.lines[pos - 1].eol = self.eol;
            }
            let inserted = replacement.len();
            self.lines.splice(pos..pos + before.len(), replacement);
            delta += inserted as isize - before.len() as isize;
            floor = pos + inserted;

            if floor == self.lines.len() {
                if let Some(last) = self.lines.last_mut() {
                    last.eol = if hunk.target_missing_newline {
                        b""
                    } else if last.eol.is_empty() {
                        self.eol
                    } else {
                        last.eol
                    };
                }
            } else if let Some(line) = floor.checked_sub(1).and_then(|i| self.lines.get_mut(i)) {
                // Lines in the middle of the file always need a terminator.
                if line.eol.is_empty() {
                    line.eol = self.eol;
                }
            }
        }

        Ok(())
    }

    /// Nearest position at or after `floor` where `before` matches,
    /// searching outward from `expected`.
    fn locate(&self, before: &[&str], expected: usize, floor: usize) -> Option<usize> {
        let len = self.lines.len();
        if before.len() > len {
            return None;
        }
        let last_start = len - before.len();
        if floor > last_start {
            return None;
        }
        let expected = expected.clamp(floor, last_start);

        let fits = |pos: usize| {
            before
                .iter()
                .enumerate()
                .all(|(i, text)| self.lines[pos + i].matches(text))
        };

        let span = (expected - floor).max(last_start - expected);
        for distance in 0..=span {
            if let Some(pos) = expected.checked_add(distance).filter(|&p| p <= last_start) {
                if fits(pos) {
                    return Some(pos);
                }
            }
            if distance > 0 {
                if let Some(pos) = expected.checked_sub(distance).filter(|&p| p >= floor) {
                    if fits(pos) {
                        return Some(pos);
                    }
                }
            }
        }
        None
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.lines {
            out.extend_from_slice(&line.text);
            out.extend_from_slice(line.eol);
        }
        out
    }
}
