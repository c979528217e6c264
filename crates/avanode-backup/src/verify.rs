// SNAPSHOT VERIFICATION
//
// A snapshot is sound when:
// 1. Its manifest lists every required identity and config entry, or a
//    pre-restore manifest records the entry as absent from the live node
// 2. Every listed file exists with the recorded size and SHA-256
// 3. The file count on disk matches the manifest
// 4. Secret entries carry no group or world permission bits
// 5. An included data archive can be listed end to end
//
// A data archive below the plausible minimum is a warning, not a violation.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::archive::{list_archive, MIN_PLAUSIBLE_ARCHIVE_BYTES};
use crate::snapshot::{SnapshotManifest, MANIFEST_FILE, REQUIRED_ENTRIES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotViolation {
    ManifestUnreadable(String),
    MissingEntry(String),
    MissingFile(String),
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    ChecksumMismatch(String),
    CountMismatch {
        expected: usize,
        actual: usize,
    },
    InsecureMode {
        path: String,
        mode: u32,
    },
    ArchiveUnreadable(String),
}

impl fmt::Display for SnapshotViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotViolation::ManifestUnreadable(e) => write!(f, "manifest unreadable: {}", e),
            SnapshotViolation::MissingEntry(p) => write!(f, "manifest does not list {}", p),
            SnapshotViolation::MissingFile(p) => write!(f, "{} listed but missing", p),
            SnapshotViolation::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "{}: size {} != recorded {}", path, actual, expected),
            SnapshotViolation::ChecksumMismatch(p) => write!(f, "{}: checksum mismatch", p),
            SnapshotViolation::CountMismatch { expected, actual } => {
                write!(f, "file count {} != recorded {}", actual, expected)
            }
            SnapshotViolation::InsecureMode { path, mode } => {
                write!(f, "{}: secret file has mode {:o}", path, mode)
            }
            SnapshotViolation::ArchiveUnreadable(e) => write!(f, "data archive unreadable: {}", e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub violations: Vec<SnapshotViolation>,
    pub warnings: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Size and lowercase hex SHA-256 of a file
pub(crate) fn hash_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Regular files under `dir`, excluding the manifest and `skip`.
fn count_files(dir: &Path, root: &Path, skip: Option<&str>) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            count += count_files(&path, root, skip)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if rel != MANIFEST_FILE && Some(rel.as_str()) != skip {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Check a snapshot directory against its manifest.
pub async fn verify_dir(
    dir: &Path,
    manifest: &SnapshotManifest,
    archive_timeout: Duration,
) -> VerifyReport {
    let mut report = VerifyReport::default();

    for required in REQUIRED_ENTRIES {
        if manifest.entry(required).is_some() {
            continue;
        }
        if manifest.records_absent(required) {
            report
                .warnings
                .push(format!("{} did not exist when the snapshot was taken", required));
        } else {
            report
                .violations
                .push(SnapshotViolation::MissingEntry(required.to_string()));
        }
    }

    for entry in &manifest.files {
        let path = dir.join(&entry.path);
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => {
                report
                    .violations
                    .push(SnapshotViolation::MissingFile(entry.path.clone()));
                continue;
            }
        };

        if meta.len() != entry.size {
            report.violations.push(SnapshotViolation::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: meta.len(),
            });
        } else {
            match hash_file(&path) {
                Ok((_, digest)) if digest == entry.sha256 => {}
                _ => report
                    .violations
                    .push(SnapshotViolation::ChecksumMismatch(entry.path.clone())),
            }
        }

        let mode = meta.permissions().mode() & 0o7777;
        if entry.secret && mode & 0o077 != 0 {
            report.violations.push(SnapshotViolation::InsecureMode {
                path: entry.path.clone(),
                mode,
            });
        }
    }

    let archive_name = manifest.data_archive.as_ref().map(|a| a.path.as_str());
    match count_files(dir, dir, archive_name) {
        Ok(actual) if actual == manifest.files.len() && manifest.file_count == actual => {}
        Ok(actual) => report.violations.push(SnapshotViolation::CountMismatch {
            expected: manifest.file_count,
            actual,
        }),
        Err(e) => report
            .violations
            .push(SnapshotViolation::ManifestUnreadable(e.to_string())),
    }

    if let Some(archive) = &manifest.data_archive {
        let path = dir.join(&archive.path);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() == archive.size => {
                if let Err(e) = list_archive(&path, archive_timeout).await {
                    report
                        .violations
                        .push(SnapshotViolation::ArchiveUnreadable(e.to_string()));
                }
                if meta.len() < MIN_PLAUSIBLE_ARCHIVE_BYTES {
                    report.warnings.push(format!(
                        "data archive is only {} bytes; expected at least {} unless the node is fresh",
                        meta.len(),
                        MIN_PLAUSIBLE_ARCHIVE_BYTES
                    ));
                }
            }
            Ok(meta) => report.violations.push(SnapshotViolation::SizeMismatch {
                path: archive.path.clone(),
                expected: archive.size,
                actual: meta.len(),
            }),
            Err(_) => report
                .violations
                .push(SnapshotViolation::MissingFile(archive.path.clone())),
        }
    }

    report
}

/// Verify a snapshot directory, reading its manifest from disk.
pub async fn verify_snapshot_dir(dir: &Path, archive_timeout: Duration) -> VerifyReport {
    match SnapshotManifest::read(dir) {
        Ok(manifest) => verify_dir(dir, &manifest, archive_timeout).await,
        Err(e) => VerifyReport {
            violations: vec![SnapshotViolation::ManifestUnreadable(e.to_string())],
            warnings: Vec::new(),
        },
    }
}
