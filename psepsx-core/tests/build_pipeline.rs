use image::{DynamicImage, GenericImageView, ImageOutputFormat, Rgba, RgbaImage};
use psepsx_core::{
    build_options, checksum, collect_diff_files, parse_catalog, run, run_with_status, BuildError,
    BuildOption, BuildSettings, BuildStage, ReferenceArchive, TransformRegistry,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

fn write_zip(path: &Path, members: &[(&str, Vec<u8>)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in members {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

fn png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
    buf.into_inner()
}

fn read_member(archive: &Path, member: &str) -> Vec<u8> {
    let archive = ReferenceArchive::open(archive).unwrap();
    let mut bytes = Vec::new();
    archive.open_member(member).unwrap().read_to_end(&mut bytes).unwrap();
    bytes
}

/// A game install stand-in: reference archive, patch dir and mods dir.
struct Install {
    temp: TempDir,
}

impl Install {
    fn new(members: &[(&str, Vec<u8>)]) -> Self {
        let temp = TempDir::new().unwrap();
        write_zip(&temp.path().join("PowerslaveEX.kpf"), members);
        fs::create_dir_all(temp.path().join("Patches")).unwrap();
        Self { temp }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.temp.path().join(relative)
    }

    fn add_diff(&self, name: &str, text: &str) {
        fs::write(self.path("Patches").join(name), text).unwrap();
    }

    fn settings(&self) -> BuildSettings {
        let mut settings = BuildSettings::new(self.path("PowerslaveEX.kpf"), self.path("mods/PSEPSX.kpf"));
        settings.diff_files = collect_diff_files(&self.path("Patches")).unwrap();
        settings.work_dir = Some(self.path("work"));
        settings
    }

    fn work_dir_is_empty(&self) -> bool {
        let work = self.path("work");
        !work.exists() || fs::read_dir(work).unwrap().next().is_none()
    }
}

#[test]
fn blanked_scarab_keeps_dimensions() {
    let scarab = DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 64, Rgba([200, 150, 0, 255])));
    let install = Install::new(&[("gfx/scarab.png", png(&scarab))]);

    let mut settings = install.settings();
    settings.options = vec![BuildOption::new("NoHUDScarabs", true)
        .with_pattern("")
        .with_transform("NoHUDScarabs")];
    let report = run(&settings).unwrap();
    assert_eq!(report.transforms_run, 1);

    let blank = image::load_from_memory(&read_member(&settings.output_path, "gfx/scarab.png")).unwrap();
    assert_eq!(blank.dimensions(), (64, 64));
    assert_eq!(blank.color(), scarab.color());
    assert!(blank.to_rgba8().pixels().all(|p| p.0[3] == 0));
}

#[test]
fn created_file_is_packaged() {
    let install = Install::new(&[("data/old.txt", b"old\n".to_vec())]);
    install.add_diff(
        "10-new.diff",
        "--- /dev/null\n+++ data/new.txt\n@@ -0,0 +1,2 @@\n+X\n+Y\n",
    );

    let settings = install.settings();
    let report = run(&settings).unwrap();

    assert_eq!(report.files_created, 1);
    assert_eq!(report.packaged_files, 1);
    assert_eq!(read_member(&settings.output_path, "data/new.txt"), b"X\nY\n");
    assert!(install.work_dir_is_empty());
}

#[test]
fn checksum_mismatch_never_patches() {
    let install = Install::new(&[("data/old.txt", b"old\n".to_vec())]);
    install.add_diff("10.diff", "--- /dev/null\n+++ new.txt\n@@ -0,0 +1 @@\n+X\n");

    let mut settings = install.settings();
    settings.expected_checksum = Some("DEADBEEF".to_string());

    let mut stages = Vec::new();
    let err = run_with_status(&settings, &TransformRegistry::with_builtins(), |status| {
        stages.push(status.stage)
    })
    .unwrap_err();

    assert!(matches!(err, BuildError::ArchiveMismatch { expected, .. } if expected == "DEADBEEF"));
    assert!(!stages.contains(&BuildStage::Patching));
    assert_eq!(stages.last(), Some(&BuildStage::Failed));
    assert!(!settings.output_path.exists());
}

#[test]
fn matching_checksum_is_case_insensitive() {
    let install = Install::new(&[("data/old.txt", b"old\n".to_vec())]);
    let mut settings = install.settings();
    settings.expected_checksum = Some(checksum(&settings.archive_path).unwrap().to_lowercase());
    assert!(run(&settings).is_ok());
}

#[test]
fn deleted_file_is_absent_from_package() {
    let install = Install::new(&[("data/old.txt", b"old\n".to_vec())]);
    install.add_diff(
        "10-add.diff",
        "--- /dev/null\n+++ data/tmp.txt\n@@ -0,0 +1 @@\n+tmp\n\
         --- /dev/null\n+++ data/keep.txt\n@@ -0,0 +1 @@\n+keep\n",
    );
    install.add_diff("20-remove.diff", "--- data/tmp.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-tmp\n");

    let settings = install.settings();
    let report = run(&settings).unwrap();

    assert_eq!(report.diffs_applied, 2);
    assert_eq!(report.files_deleted, 1);
    let package = ReferenceArchive::open(&settings.output_path).unwrap();
    assert_eq!(package.member_names().collect::<Vec<_>>(), vec!["data/keep.txt"]);
}

#[test]
fn diffs_apply_in_file_name_order() {
    let install = Install::new(&[("scripts/game.txt", b"one\ntwo\nthree\n".to_vec())]);
    // Written out of order; the second depends on the first.
    install.add_diff(
        "20-second.diff",
        "--- a/scripts/game.txt\n+++ b/scripts/game.txt\n@@ -1,3 +1,3 @@\n one\n-TWO\n+2\n three\n",
    );
    install.add_diff(
        "10-first.diff",
        "diff --git a/scripts/game.txt b/scripts/game.txt\n\
         --- a/scripts/game.txt\n+++ b/scripts/game.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n",
    );

    let settings = install.settings();
    run(&settings).unwrap();

    assert_eq!(read_member(&settings.output_path, "scripts/game.txt"), b"one\n2\nthree\n");
}

#[test]
fn catalog_drives_preprocessing_and_transforms() {
    let mut head = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 255]));
    head.put_pixel(0, 0, Rgba([255, 255, 255, 255]));
    let install = Install::new(&[
        ("gfx/head_right.png", png(&DynamicImage::ImageRgba8(head))),
        ("scripts/hud.txt", b"heads = 0\n".to_vec()),
    ]);
    install.add_diff(
        "10-hud.diff",
        "--- scripts/hud.txt\n+++ scripts/hud.txt\n@@ -1 +1,2 @@\n-heads = 0\n+heads = HUD_HEADS\n+doors = FAST_DOORS\n",
    );

    let catalog = parse_catalog(
        r#"[
            {"id": "HUDHeads", "category": "HUD", "definition": "HUD_HEADS", "script": "HUDHeads"},
            {"id": "FastDoors", "category": "Gameplay", "definition": "FAST_DOORS"}
        ]"#,
    )
    .unwrap();
    let toggles = HashMap::from([("FastDoors".to_string(), false)]);

    let mut settings = install.settings();
    settings.options = build_options(&catalog, &toggles);
    run(&settings).unwrap();

    assert_eq!(
        read_member(&settings.output_path, "scripts/hud.txt"),
        b"heads = 1\ndoors = 0\n"
    );
    let left = image::load_from_memory(&read_member(&settings.output_path, "gfx/head_left.png"))
        .unwrap()
        .to_rgba8();
    assert_eq!(left.get_pixel(1, 0), &Rgba([255, 255, 255, 255]));
    // The flip source is never copied into the package.
    let package = ReferenceArchive::open(&settings.output_path).unwrap();
    assert!(!package.exists("gfx/head_right.png"));
}

#[test]
fn failed_build_cleans_up_working_tree() {
    let install = Install::new(&[("scripts/hud.txt", b"a\n".to_vec())]);
    install.add_diff("10.diff", "--- scripts/hud.txt\n+++ scripts/hud.txt\n@@ -1 +1 @@\n-b\n+c\n");

    let settings = install.settings();
    let err = run(&settings).unwrap_err();

    assert!(matches!(err, BuildError::HunkMismatch { hunk: 1, .. }));
    assert!(!settings.output_path.exists());
    assert!(install.work_dir_is_empty());
}
