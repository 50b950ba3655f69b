use clap::{Args, Parser, Subcommand};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use psepsx_core::{
    build_options, categories, checksum, collect_diff_files, load_catalog, run_per_diff, spawn,
    BuildError, BuildEvent, BuildOption, BuildSettings, OptionDescriptor, Result,
    TransformRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "PSEPSX-CLI", version, about = "Builds the PSEPSX patch package for Powerslave Exhumed")]
struct Cli {
    /// Enabled toggles file; defaults to the per-user config directory.
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply every patch, copy overlay files, preprocess and pack.
    Build(BuildArgs),
    /// Pack each diff on its own into `<output-dir>/<diff name>.kpf`.
    Split(SplitArgs),
    /// List catalog options, optionally updating their saved toggles.
    Options(OptionsArgs),
    /// Print the CRC-32 fingerprint of an archive.
    Checksum { archive: PathBuf },
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// The game's reference archive (PowerslaveEX.kpf).
    #[arg(long)]
    archive: PathBuf,

    #[arg(long, default_value = "Patches")]
    patches: PathBuf,

    /// Directory of files copied verbatim over the patched tree.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Defaults to `mods/PSEPSX.kpf` next to the archive.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    catalog: Option<PathBuf>,

    #[command(flatten)]
    toggles: ToggleArgs,

    #[arg(long, value_name = "CRC32")]
    expected_checksum: Option<String>,

    #[arg(long)]
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SplitArgs {
    #[arg(long)]
    archive: PathBuf,

    #[arg(long, default_value = "Patches")]
    patches: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    /// Remove the output directory before packing.
    #[arg(long, default_value_t = false)]
    clean: bool,

    #[arg(long)]
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct OptionsArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[command(flatten)]
    toggles: ToggleArgs,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    #[arg(long, value_name = "ID")]
    enable: Vec<String>,

    #[arg(long, value_name = "ID")]
    disable: Vec<String>,
}

impl ToggleArgs {
    fn is_empty(&self) -> bool {
        self.enable.is_empty() && self.disable.is_empty()
    }

    fn apply(&self, toggles: &mut HashMap<String, bool>) {
        for id in &self.enable {
            toggles.insert(id.clone(), true);
        }
        for id in &self.disable {
            toggles.insert(id.clone(), false);
        }
    }
}

fn default_settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir().or_else(dirs::data_dir)?;
    base.push("PSEPSX");
    base.push("settings.json");
    Some(base)
}

/// Missing or unreadable files yield no toggles, i.e. everything enabled.
fn load_toggles(path: Option<&Path>) -> HashMap<String, bool> {
    let Some(path) = path else {
        return HashMap::new();
    };
    match fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable settings {}: {}", path.display(), e);
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

fn save_toggles(path: &Path, toggles: &HashMap<String, bool>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let sorted: BTreeMap<&String, &bool> = toggles.iter().collect();
    let data = serde_json::to_string_pretty(&sorted)
        .map_err(|e| BuildError::Config(format!("Failed to serialize settings: {e}")))?;
    fs::write(path, data).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, source: std::io::Error) -> BuildError {
    BuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Options named on the command line but absent from the catalog still
/// reach the preprocessor, with the id as their pattern.
fn resolve_options(
    catalog: &[OptionDescriptor],
    toggles: &HashMap<String, bool>,
    overrides: &ToggleArgs,
) -> Vec<BuildOption> {
    let mut options = build_options(catalog, toggles);
    for (id, enabled) in overrides
        .enable
        .iter()
        .map(|id| (id, true))
        .chain(overrides.disable.iter().map(|id| (id, false)))
    {
        if !options.iter().any(|o| &o.id == id) {
            options.push(BuildOption::new(id.clone(), enabled));
        }
    }
    options
}

fn build(args: BuildArgs, settings_path: Option<&Path>) -> Result<()> {
    let mut toggles = load_toggles(settings_path);
    args.toggles.apply(&mut toggles);
    let catalog = match args.catalog.as_deref() {
        Some(path) => load_catalog(path)?,
        None => Vec::new(),
    };

    let output = args.output.unwrap_or_else(|| {
        args.archive
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("mods")
            .join("PSEPSX.kpf")
    });
    let mut settings = BuildSettings::new(args.archive, output);
    settings.diff_files = collect_diff_files(&args.patches)?;
    settings.overlay_dir = args.data;
    settings.options = resolve_options(&catalog, &toggles, &args.toggles);
    settings.expected_checksum = args.expected_checksum;
    settings.work_dir = args.work_dir;

    let handle = spawn(settings, TransformRegistry::with_builtins());
    for event in handle.events().iter() {
        match event {
            BuildEvent::Status(status) => println!("{}", status.message),
            BuildEvent::Finished(result) => {
                let report = result?;
                println!(
                    "Applied {} diffs ({} created, {} deleted, {} patched), copied {} overlay files, \
                     preprocessed {} text files, ran {} transforms, packed {} files.",
                    report.diffs_applied,
                    report.files_created,
                    report.files_deleted,
                    report.files_patched,
                    report.overlay_files,
                    report.preprocessed_files,
                    report.transforms_run,
                    report.packaged_files,
                );
                return Ok(());
            }
        }
    }
    Err(BuildError::Config("build ended without a result".to_string()))
}

fn split(args: SplitArgs) -> Result<()> {
    if args.clean && args.output_dir.exists() {
        println!("Removing {}...", args.output_dir.display());
        fs::remove_dir_all(&args.output_dir).map_err(|e| io_error(&args.output_dir, e))?;
    }
    let diffs = collect_diff_files(&args.patches)?;
    let outputs = run_per_diff(&args.archive, &diffs, &args.output_dir, args.work_dir.as_deref())?;
    for output in outputs {
        println!("Packed {}", output.display());
    }
    Ok(())
}

fn options(args: OptionsArgs, settings_path: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let mut toggles = load_toggles(settings_path);

    if !args.toggles.is_empty() {
        args.toggles.apply(&mut toggles);
        let path = settings_path
            .ok_or_else(|| BuildError::Config("No settings path; pass --settings".to_string()))?;
        save_toggles(path, &toggles)?;
    }

    for (category, descriptors) in categories(&catalog) {
        println!("{}", if category.is_empty() { "(uncategorised)" } else { category });
        for descriptor in descriptors {
            let enabled = toggles.get(&descriptor.id).copied().unwrap_or(true);
            let name = if descriptor.name.is_empty() { &descriptor.id } else { &descriptor.name };
            println!(
                "  [{}] {} ({}): {}",
                if enabled { "x" } else { " " },
                name,
                descriptor.id,
                descriptor.short_description()
            );
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.or_else(default_settings_path);

    let result = match cli.command {
        Command::Build(args) => build(args, settings_path.as_deref()),
        Command::Split(args) => split(args),
        Command::Options(args) => options(args, settings_path.as_deref()),
        Command::Checksum { archive } => checksum(&archive).map(|crc| println!("{crc}")),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
