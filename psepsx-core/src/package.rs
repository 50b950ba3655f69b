//! Packing the working tree into the output archive.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::{BuildError, Result};

/// Zip every regular file under `root` into `output`, keyed by its
/// forward-slash relative path.
///
/// The archive is written to a temporary file beside `output` and renamed
/// over it once complete, so a failed build never leaves a partial package
/// at the final path and an existing package is replaced, never merged.
pub fn pack(root: &Path, output: &Path) -> Result<usize> {
    if output.is_dir() {
        return Err(BuildError::Config(format!(
            "Output path is a directory: {}",
            output.display()
        )));
    }
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;

    debug!("Packing {}...", output.display());
    let staging = tempfile::Builder::new()
        .prefix(".psepsx-pack-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| BuildError::io(parent, e))?;

    let zip_err = |e: ZipError| BuildError::Zip {
        path: output.to_path_buf(),
        source: e,
    };
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(staging);
    let mut count = 0;

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            BuildError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = member_name(root, entry.path())?;
        writer.start_file(name.as_str(), options).map_err(zip_err)?;
        let mut file = File::open(entry.path()).map_err(|e| BuildError::io(entry.path(), e))?;
        io::copy(&mut file, &mut writer).map_err(|e| BuildError::io(entry.path(), e))?;
        debug!("Packed {}", name);
        count += 1;
    }

    let staging = writer.finish().map_err(zip_err)?;
    staging
        .as_file()
        .sync_all()
        .map_err(|e| BuildError::io(staging.path(), e))?;
    staging
        .persist(output)
        .map_err(|e| BuildError::io(output, e.error))?;

    Ok(count)
}

fn member_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BuildError::UnsafePath {
            path: path.display().to_string(),
        })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn read_members(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut members = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            members.push((entry.name().to_string(), bytes));
        }
        members.sort();
        members
    }

    #[test]
    fn pack_preserves_relative_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("sub/b.png"), [0x89, b'P', b'N', b'G']).unwrap();

        let output = temp.path().join("mods/nested/PSEPSX.kpf");
        assert_eq!(pack(&root, &output).unwrap(), 2);

        assert_eq!(
            read_members(&output),
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("sub/b.png".to_string(), vec![0x89, b'P', b'N', b'G']),
            ]
        );
    }

    #[test]
    fn pack_replaces_existing_output() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("PSEPSX.kpf");

        let first = temp.path().join("first");
        fs::create_dir_all(&first).unwrap();
        fs::write(first.join("old.txt"), "old").unwrap();
        pack(&first, &output).unwrap();

        let second = temp.path().join("second");
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("new.txt"), "new").unwrap();
        pack(&second, &output).unwrap();

        assert_eq!(read_members(&output), vec![("new.txt".to_string(), b"new".to_vec())]);
    }

    #[test]
    fn pack_leaves_no_staging_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let out_dir = temp.path().join("out");
        pack(&root, &out_dir.join("PSEPSX.kpf")).unwrap();

        let names: Vec<_> = fs::read_dir(&out_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["PSEPSX.kpf"]);
    }

    #[test]
    fn output_directory_is_rejected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        let err = pack(&root, temp.path()).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }
}
