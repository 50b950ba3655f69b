//! Unified diff parsing.
//!
//! A diff file is split into [`EditItem`]s, one per `---`/`+++` header
//! pair. The special path `dev/null` on the `---` side marks a file to
//! create and on the `+++` side a file to delete.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{BuildError, Result};

pub const NULL_PATH: &str = "dev/null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub source_start: usize,
    pub source_len: usize,
    pub target_start: usize,
    pub target_len: usize,
    pub lines: Vec<HunkLine>,
    /// Line in the diff file holding the `@@` header.
    pub header_line: usize,
    pub source_missing_newline: bool,
    pub target_missing_newline: bool,
}

impl Hunk {
    /// Lines the hunk expects to find (context and removed).
    pub fn before(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(text) | HunkLine::Removed(text) => Some(text.as_str()),
            HunkLine::Added(_) => None,
        })
    }

    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Added(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Create,
    Delete,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditItem {
    /// Archive member to start from; `None` for `dev/null`.
    pub source: Option<String>,
    /// Working-tree path to produce; `None` for `dev/null`.
    pub target: Option<String>,
    pub hunks: Vec<Hunk>,
    pub header_line: usize,
}

impl EditItem {
    pub fn kind(&self) -> EditKind {
        match (&self.source, &self.target) {
            (None, _) => EditKind::Create,
            (_, None) => EditKind::Delete,
            _ => EditKind::Patch,
        }
    }

    /// The path the item is reported under.
    pub fn display_path(&self) -> &str {
        self.target
            .as_deref()
            .or(self.source.as_deref())
            .unwrap_or(NULL_PATH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffFile {
    pub name: String,
    pub items: Vec<EditItem>,
}

pub fn read_diff_file(path: impl AsRef<Path>) -> Result<DiffFile> {
    let path = path.as_ref();
    let raw = fs::read(path).map_err(|e| BuildError::io(path, e))?;
    let text = String::from_utf8_lossy(&raw);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_diff(&name, &text)
}

/// All `*.diff` files directly inside `dir`, sorted by file name.
pub fn collect_diff_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| BuildError::io(dir, e))? {
        let entry = entry.map_err(|e| BuildError::io(dir, e))?;
        let path = entry.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "diff") {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

pub fn parse_diff(name: &str, text: &str) -> Result<DiffFile> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    // A trailing newline leaves one empty element behind.
    let line_count = if text.ends_with('\n') {
        lines.len() - 1
    } else {
        lines.len()
    };

    let mut parser = Parser {
        name,
        lines: &lines[..line_count],
        pos: 0,
    };
    let items = parser.items()?;
    Ok(DiffFile {
        name: name.to_string(),
        items,
    })
}

struct Parser<'a> {
    name: &'a str,
    lines: &'a [&'a str],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn items(&mut self) -> Result<Vec<EditItem>> {
        let lines = self.lines;
        let mut items = Vec::new();
        let mut git_style = false;

        while self.pos < lines.len() {
            let line = lines[self.pos];

            if line.starts_with("diff --git ") {
                git_style = true;
                self.pos += 1;
                continue;
            }

            let next = lines.get(self.pos + 1).copied().unwrap_or("");
            if let (Some(source), Some(target)) =
                (line.strip_prefix("--- "), next.strip_prefix("+++ "))
            {
                let header_line = self.pos + 1;
                self.pos += 2;
                let source = header_path(source);
                let target = header_path(target);
                // Strip `a/` and `b/` for git diffs, or when both sides carry them.
                let prefixed = |path: &Option<String>, prefix: &str| {
                    path.as_deref().map_or(true, |p| p.starts_with(prefix))
                };
                let strip = git_style || (prefixed(&source, "a/") && prefixed(&target, "b/"));
                let source = self.finish_path(source, strip.then_some("a/"), header_line)?;
                let target = self.finish_path(target, strip.then_some("b/"), header_line + 1)?;
                if source.is_none() && target.is_none() {
                    return Err(self.malformed(NULL_PATH, header_line, "both sides are dev/null"));
                }

                let mut item = EditItem {
                    source,
                    target,
                    hunks: Vec::new(),
                    header_line,
                };
                while self.pos < lines.len() && lines[self.pos].starts_with("@@") {
                    let hunk = self.hunk(item.display_path())?;
                    item.hunks.push(hunk);
                }
                items.push(item);
                git_style = false;
                continue;
            }

            if line.starts_with("@@") {
                return Err(self.malformed("", self.pos + 1, "hunk outside of a file header"));
            }

            // Prose, `index`, `new file mode` and similar noise.
            self.pos += 1;
        }

        Ok(items)
    }

    fn finish_path(
        &self,
        path: Option<String>,
        prefix: Option<&str>,
        line: usize,
    ) -> Result<Option<String>> {
        let Some(path) = path else {
            return Ok(None);
        };
        let stripped = prefix
            .and_then(|prefix| path.strip_prefix(prefix))
            .unwrap_or(&path)
            .trim_start_matches('/');
        if stripped.is_empty() {
            return Err(self.malformed(&path, line, "empty file name in header"));
        }
        Ok(Some(stripped.to_string()))
    }

    fn hunk(&mut self, path: &str) -> Result<Hunk> {
        let lines = self.lines;
        let header_line = self.pos + 1;
        let (source_start, source_len, target_start, target_len) =
            parse_range_header(lines[self.pos])
                .ok_or_else(|| self.malformed(path, header_line, "invalid @@ range header"))?;
        self.pos += 1;

        let mut hunk = Hunk {
            source_start,
            source_len,
            target_start,
            target_len,
            lines: Vec::new(),
            header_line,
            source_missing_newline: false,
            target_missing_newline: false,
        };

        let (mut source_seen, mut target_seen) = (0usize, 0usize);
        while source_seen < source_len || target_seen < target_len {
            let Some(&line) = lines.get(self.pos) else {
                return Err(self.malformed(path, self.pos, "hunk ends before its line counts are met"));
            };
            let line_no = self.pos + 1;

            let parsed = match line.chars().next() {
                None => HunkLine::Context(String::new()),
                Some(' ') => HunkLine::Context(line[1..].to_string()),
                Some('+') => HunkLine::Added(line[1..].to_string()),
                Some('-') => HunkLine::Removed(line[1..].to_string()),
                Some('\\') => {
                    self.mark_missing_newline(&mut hunk);
                    self.pos += 1;
                    continue;
                }
                Some(_) => {
                    return Err(self.malformed(path, line_no, "line without a diff marker"));
                }
            };

            match parsed {
                HunkLine::Context(_) => {
                    source_seen += 1;
                    target_seen += 1;
                }
                HunkLine::Added(_) => target_seen += 1,
                HunkLine::Removed(_) => source_seen += 1,
            }
            if source_seen > source_len || target_seen > target_len {
                return Err(self.malformed(path, line_no, "hunk is longer than its header says"));
            }
            hunk.lines.push(parsed);
            self.pos += 1;
        }

        if lines
            .get(self.pos)
            .map_or(false, |line| line.starts_with('\\'))
        {
            self.mark_missing_newline(&mut hunk);
            self.pos += 1;
        }

        Ok(hunk)
    }

    fn mark_missing_newline(&self, hunk: &mut Hunk) {
        match hunk.lines.last() {
            Some(HunkLine::Context(_)) => {
                hunk.source_missing_newline = true;
                hunk.target_missing_newline = true;
            }
            Some(HunkLine::Removed(_)) => hunk.source_missing_newline = true,
            Some(HunkLine::Added(_)) => hunk.target_missing_newline = true,
            None => {}
        }
    }

    fn malformed(&self, path: &str, line: usize, reason: &str) -> BuildError {
        BuildError::MalformedHunk {
            diff: self.name.to_string(),
            path: path.to_string(),
            line,
            reason: reason.to_string(),
        }
    }
}

/// Header path without its timestamp; `None` for `dev/null`.
fn header_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or("").trim_end().replace('\\', "/");
    (path.trim_start_matches('/') != NULL_PATH).then_some(path)
}

/// `@@ -a[,b] +c[,d] @@ [section]` -> (a, b, c, d); omitted counts are 1.
fn parse_range_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ ")?;
    let end = rest.find(" @@")?;
    let mut ranges = rest[..end].split_whitespace();
    let source = ranges.next()?.strip_prefix('-')?;
    let target = ranges.next()?.strip_prefix('+')?;
    if ranges.next().is_some() {
        return None;
    }

    fn range(text: &str) -> Option<(usize, usize)> {
        match text.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((text.parse().ok()?, 1)),
        }
    }

    let (source_start, source_len) = range(source)?;
    let (target_start, target_len) = range(target)?;
    Some((source_start, source_len, target_start, target_len))
}
