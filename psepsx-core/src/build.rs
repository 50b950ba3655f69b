//! Build orchestration.
//!
//! A build walks a fixed sequence of stages and never goes back:
//!
//! ```text
//! Idle -> Validating -> Patching -> CopyingOverlay -> Preprocessing
//!      -> Transforming -> Packing -> Done
//! ```
//!
//! Any failure moves straight to `Failed`. In both terminal cases the
//! reference archive is closed first and the working tree removed after.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{verify_checksum, ReferenceArchive};
use crate::diff::read_diff_file;
use crate::options::BuildSettings;
use crate::package::pack;
use crate::patch::{apply_diff, PatchSummary};
use crate::preprocess::Preprocessor;
use crate::transform::TransformRegistry;
use crate::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Idle,
    Validating,
    Patching,
    CopyingOverlay,
    Preprocessing,
    Transforming,
    Packing,
    Done,
    Failed,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Idle => "idle",
            BuildStage::Validating => "validating",
            BuildStage::Patching => "patching",
            BuildStage::CopyingOverlay => "copying overlay",
            BuildStage::Preprocessing => "preprocessing",
            BuildStage::Transforming => "transforming",
            BuildStage::Packing => "packing",
            BuildStage::Done => "done",
            BuildStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A human-readable progress note. Carries no control meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStatus {
    pub stage: BuildStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub output_path: PathBuf,
    pub diffs_applied: usize,
    pub files_created: usize,
    pub files_deleted: usize,
    pub files_extracted: usize,
    pub files_patched: usize,
    pub overlay_files: usize,
    pub preprocessed_files: usize,
    pub transforms_run: usize,
    pub packaged_files: usize,
}

impl BuildReport {
    fn absorb(&mut self, summary: PatchSummary) {
        self.files_created += summary.created;
        self.files_deleted += summary.deleted;
        self.files_extracted += summary.extracted;
        self.files_patched += summary.patched;
    }
}

/// Scratch directory owned by one build. Removed on [`close`](Self::close)
/// or when dropped, whichever comes first.
pub struct WorkingTree {
    root: PathBuf,
    dir: Option<TempDir>,
}

impl WorkingTree {
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("psepsx-build-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
                builder.tempdir_in(parent).map_err(|e| BuildError::io(parent, e))?
            }
            None => builder
                .tempdir()
                .map_err(|e| BuildError::io(std::env::temp_dir(), e))?,
        };
        Ok(Self {
            root: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn close(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close().map_err(|e| BuildError::io(&self.root, e)),
            None => Ok(()),
        }
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove working tree {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Build with the built-in transforms and no status observer.
pub fn run(settings: &BuildSettings) -> Result<BuildReport> {
    run_with_status(settings, &TransformRegistry::with_builtins(), |_| {})
}

pub fn run_with_status<F>(
    settings: &BuildSettings,
    registry: &TransformRegistry,
    on_status: F,
) -> Result<BuildReport>
where
    F: FnMut(&BuildStatus),
{
    let mut pipeline = Pipeline {
        settings,
        registry,
        on_status,
        stage: BuildStage::Idle,
        report: BuildReport {
            output_path: settings.output_path.clone(),
            ..BuildReport::default()
        },
    };

    match pipeline.execute() {
        Ok(()) => {
            let message = format!("Built {}", settings.output_path.display());
            pipeline.enter(BuildStage::Done, message);
            Ok(pipeline.report)
        }
        Err(err) => {
            pipeline.enter(BuildStage::Failed, format!("Build failed: {err}"));
            Err(err)
        }
    }
}

struct Pipeline<'a, F> {
    settings: &'a BuildSettings,
    registry: &'a TransformRegistry,
    on_status: F,
    stage: BuildStage,
    report: BuildReport,
}

impl<'a, F: FnMut(&BuildStatus)> Pipeline<'a, F> {
    fn enter(&mut self, stage: BuildStage, message: impl Into<String>) {
        self.stage = stage;
        self.status(message);
    }

    fn status(&mut self, message: impl Into<String>) {
        let status = BuildStatus {
            stage: self.stage,
            message: message.into(),
        };
        debug!("[{}] {}", status.stage, status.message);
        (self.on_status)(&status);
    }

    fn execute(&mut self) -> Result<()> {
        let settings = self.settings;

        if let Some(expected) = settings.expected_checksum.as_deref() {
            self.enter(
                BuildStage::Validating,
                format!("Verifying {}...", settings.archive_path.display()),
            );
            verify_checksum(&settings.archive_path, expected)?;
        }

        if let Some(dir) = settings.overlay_dir.as_deref() {
            if !dir.is_dir() {
                return Err(BuildError::Config(format!(
                    "Overlay directory does not exist: {}",
                    dir.display()
                )));
            }
        }
        let preprocessor = Preprocessor::new(&settings.options, &settings.text_extensions)?;

        let archive = ReferenceArchive::open(&settings.archive_path)?;
        let tree = WorkingTree::create(settings.work_dir.as_deref())?;

        let result = self.stages(&archive, tree.root(), &preprocessor);

        drop(archive);
        if let Err(e) = tree.close() {
            warn!("{}", e);
        }
        result
    }

    fn stages(
        &mut self,
        archive: &ReferenceArchive,
        root: &Path,
        preprocessor: &Preprocessor,
    ) -> Result<()> {
        let settings = self.settings;

        self.enter(
            BuildStage::Patching,
            format!("Applying {} diff files...", settings.diff_files.len()),
        );
        for path in &settings.diff_files {
            self.status(format!("Applying {}...", path.display()));
            let diff = read_diff_file(path)?;
            let summary = apply_diff(&diff, archive, root)?;
            self.report.absorb(summary);
            self.report.diffs_applied += 1;
        }

        self.enter(BuildStage::CopyingOverlay, "Copying overlay files...");
        if let Some(dir) = settings.overlay_dir.as_deref() {
            for file in overlay_files(dir)? {
                self.status(format!("Copying {}...", file.display()));
                copy_overlay_file(dir, &file, root)?;
                self.report.overlay_files += 1;
            }
        }

        self.enter(BuildStage::Preprocessing, "Preprocessing text assets...");
        for file in preprocessor.text_assets(root)? {
            self.status(format!("Preprocessing {}...", file.display()));
            preprocessor.process_file(&file)?;
            self.report.preprocessed_files += 1;
        }

        self.enter(BuildStage::Transforming, "Applying transforms...");
        for option in &settings.options {
            if let Some(name) = option.active_transform() {
                self.status(format!("Applying script {}...", name));
                self.registry.run(name, archive, root)?;
                self.report.transforms_run += 1;
            }
        }

        self.enter(
            BuildStage::Packing,
            format!("Packing {}...", settings.output_path.display()),
        );
        self.report.packaged_files = pack(root, &settings.output_path)?;
        Ok(())
    }
}

fn overlay_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            BuildError::io(path, e.into())
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn copy_overlay_file(dir: &Path, file: &Path, root: &Path) -> Result<()> {
    let relative = file.strip_prefix(dir).map_err(|_| BuildError::UnsafePath {
        path: file.display().to_string(),
    })?;
    let dest = root.join(relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    fs::copy(file, &dest).map_err(|e| BuildError::io(file, e))?;
    Ok(())
}

#[derive(Debug)]
pub enum BuildEvent {
    Status(BuildStatus),
    Finished(Result<BuildReport>),
}

/// A build running on its own thread.
pub struct BuildHandle {
    events: Receiver<BuildEvent>,
    thread: JoinHandle<()>,
}

/// Run the whole pipeline off the calling thread. Status events stream over
/// the handle's channel, followed by exactly one `Finished`.
pub fn spawn(settings: BuildSettings, registry: TransformRegistry) -> BuildHandle {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let status_tx = tx.clone();
        let result = run_with_status(&settings, &registry, |status| {
            let _ = status_tx.send(BuildEvent::Status(status.clone()));
        });
        let _ = tx.send(BuildEvent::Finished(result));
    });
    BuildHandle { events: rx, thread }
}

impl BuildHandle {
    pub fn events(&self) -> &Receiver<BuildEvent> {
        &self.events
    }

    /// Block until the build finishes, dropping any unread status events.
    pub fn join(self) -> Result<BuildReport> {
        let BuildHandle { events, thread } = self;
        let mut outcome = None;
        for event in events.iter() {
            if let BuildEvent::Finished(result) = event {
                outcome = Some(result);
                break;
            }
        }
        if thread.join().is_err() {
            warn!("Build thread panicked");
        }
        outcome.unwrap_or_else(|| {
            Err(BuildError::Config(
                "build thread exited without a result".to_string(),
            ))
        })
    }
}

/// Build one package per diff file, named after the diff's stem, each from
/// its own fresh working tree.
pub fn run_per_diff(
    archive_path: &Path,
    diff_files: &[PathBuf],
    output_dir: &Path,
    work_dir: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let archive = ReferenceArchive::open(archive_path)?;
    fs::create_dir_all(output_dir).map_err(|e| BuildError::io(output_dir, e))?;

    let mut outputs = Vec::new();
    for path in diff_files {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| BuildError::Config(format!("Diff path has no file name: {}", path.display())))?;
        let output = output_dir.join(format!("{stem}.kpf"));

        let tree = WorkingTree::create(work_dir)?;
        info!("Applying {}...", path.display());
        let diff = read_diff_file(path)?;
        apply_diff(&diff, &archive, tree.root())?;
        pack(tree.root(), &output)?;
        tree.close()?;

        outputs.push(output);
    }
    Ok(outputs)
}
