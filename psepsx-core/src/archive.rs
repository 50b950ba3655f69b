//! Read-only access to the reference archive.
//!
//! The reference archive is a plain zip container (`.kpf`). Members are
//! addressed by their exact, case-sensitive, forward-slash path.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::{BuildError, Result};

const CHECKSUM_CHUNK_SIZE: usize = 64 * 1024;

/// The capability transforms get: open one archive member for reading.
pub trait MemberSource {
    fn open(&self, member: &str) -> Result<Box<dyn Read + Send>>;
}

pub struct ReferenceArchive {
    path: PathBuf,
    members: BTreeSet<String>,
    zip: Mutex<ZipArchive<File>>,
}

impl ReferenceArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| BuildError::io(&path, e))?;
        let zip = ZipArchive::new(file).map_err(|e| BuildError::Zip {
            path: path.clone(),
            source: e,
        })?;

        let members: BTreeSet<String> = zip
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        debug!("Opened {} ({} members)", path.display(), members.len());

        Ok(Self {
            path,
            members,
            zip: Mutex::new(zip),
        })
    }

    pub fn exists(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    /// Read a member into its own buffer. Every call yields an independent
    /// stream, so readers never share a cursor.
    pub fn open_member(&self, member: &str) -> Result<Box<dyn Read + Send>> {
        let mut buf = Vec::new();
        self.with_member(member, |entry| entry.read_to_end(&mut buf).map(|_| ()))?;
        Ok(Box::new(Cursor::new(buf)))
    }

    /// Copy a member verbatim to `dest`, creating parent directories.
    pub fn extract_to(&self, member: &str, dest: &Path) -> Result<u64> {
        if !self.exists(member) {
            return Err(BuildError::NotFound {
                member: member.to_string(),
            });
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        let mut out = File::create(dest).map_err(|e| BuildError::io(dest, e))?;
        let mut written = 0;
        self.with_member(member, |entry| {
            written = io::copy(entry, &mut out)?;
            Ok(())
        })
        .map_err(|e| match e {
            BuildError::Io { source, .. } => BuildError::io(dest, source),
            other => other,
        })?;
        debug!("Extracted {} -> {} ({} bytes)", member, dest.display(), written);
        Ok(written)
    }

    fn with_member(
        &self,
        member: &str,
        f: impl FnOnce(&mut zip::read::ZipFile<'_>) -> io::Result<()>,
    ) -> Result<()> {
        if !self.exists(member) {
            return Err(BuildError::NotFound {
                member: member.to_string(),
            });
        }
        let mut zip = self.zip.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entry = zip.by_name(member).map_err(|e| match e {
            ZipError::FileNotFound => BuildError::NotFound {
                member: member.to_string(),
            },
            other => BuildError::Zip {
                path: self.path.clone(),
                source: other,
            },
        })?;
        f(&mut entry).map_err(|e| BuildError::io(&self.path, e))
    }
}

impl MemberSource for ReferenceArchive {
    fn open(&self, member: &str) -> Result<Box<dyn Read + Send>> {
        self.open_member(member)
    }
}

/// CRC-32 of the whole file as 8 uppercase hex digits, streamed in
/// fixed-size chunks.
pub fn checksum(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk = vec![0u8; CHECKSUM_CHUNK_SIZE];
    loop {
        let n = match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BuildError::io(path, e)),
        };
        hasher.update(&chunk[..n]);
    }
    Ok(format!("{:08X}", hasher.finalize()))
}

pub fn verify_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = checksum(path)?;
    let expected = expected.trim().to_ascii_uppercase();
    if actual != expected {
        return Err(BuildError::ArchiveMismatch { expected, actual });
    }
    Ok(())
}
