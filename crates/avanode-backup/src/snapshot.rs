// SNAPSHOT IDENTITY AND MANIFEST
//
// SAFETY INVARIANTS:
// 1. Snapshots order purely by the timestamp in their id
// 2. Two snapshots taken in the same second get increasing sequence suffixes
// 3. The manifest on disk, not memory, is what verification trusts

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{at, BackupError};

/// Timestamp component of a snapshot directory name
pub const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub const MANIFEST_FILE: &str = "manifest.json";

/// Entries every snapshot must carry
pub const REQUIRED_ENTRIES: [&str; 4] = [
    "identity/staker.crt",
    "identity/staker.key",
    "identity/signer.key",
    "config/node.json",
];

/// Snapshot identifier: `20261018T142233Z`, or `20261018T142233Z-1` for the
/// second snapshot taken within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    taken_at: NaiveDateTime,
    seq: u32,
}

impl SnapshotId {
    pub fn new(taken_at: DateTime<Utc>, seq: u32) -> Self {
        let naive = taken_at.naive_utc();
        SnapshotId {
            taken_at: naive.with_nanosecond(0).unwrap_or(naive),
            seq,
        }
    }

    /// Next free id at `now`, given the ids already on disk.
    pub fn next(now: DateTime<Utc>, existing: &[SnapshotId]) -> Self {
        let base = SnapshotId::new(now, 0);
        let seq = existing
            .iter()
            .filter(|id| id.taken_at == base.taken_at)
            .map(|id| id.seq + 1)
            .max()
            .unwrap_or(0);
        SnapshotId { seq, ..base }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_naive_utc_and_offset(self.taken_at, Utc)
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.taken_at.format(STAMP_FORMAT))?;
        if self.seq > 0 {
            write!(f, "-{}", self.seq)?;
        }
        Ok(())
    }
}

impl FromStr for SnapshotId {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BackupError::InvalidId(s.to_string());
        let (stamp, seq) = match s.split_once('-') {
            Some((stamp, seq)) => (stamp, seq.parse::<u32>().map_err(|_| invalid())?),
            None => (s, 0),
        };
        let taken_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).map_err(|_| invalid())?;
        Ok(SnapshotId { taken_at, seq })
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> String {
        id.to_string()
    }
}

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotReason {
    Manual,
    PreRestore,
    PreUpgrade,
    PreMigrate,
    PreRegenerate,
}

impl fmt::Display for SnapshotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotReason::Manual => "manual",
            SnapshotReason::PreRestore => "pre-restore",
            SnapshotReason::PreUpgrade => "pre-upgrade",
            SnapshotReason::PreMigrate => "pre-migrate",
            SnapshotReason::PreRegenerate => "pre-regenerate",
        })
    }
}

/// One file captured in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the snapshot directory
    pub path: String,

    pub size: u64,

    /// Lowercase hex SHA-256 of the content
    pub sha256: String,

    /// Mode applied to the snapshot copy
    pub mode: u32,

    /// Secret material must stay owner-only
    pub secret: bool,
}

/// Data directory tarball, when included
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub reason: SnapshotReason,
    pub files: Vec<ManifestEntry>,
    pub file_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_archive: Option<ArchiveEntry>,

    /// Required material that did not exist when a pre-restore snapshot was taken
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub absent: Vec<String>,
    pub tool_version: String,
}

impl SnapshotManifest {
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|e| e.path == path)
    }

    /// Whether `path` was recorded as missing from the live node at snapshot time
    pub fn records_absent(&self, path: &str) -> bool {
        self.reason == SnapshotReason::PreRestore && self.absent.iter().any(|p| p == path)
    }

    pub fn read(dir: &Path) -> Result<Self, BackupError> {
        let path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(at(&path))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// A committed snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub path: PathBuf,
    pub manifest: SnapshotManifest,
}

impl Snapshot {
    pub fn open(dir: &Path) -> Result<Self, BackupError> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id: SnapshotId = name.parse()?;
        let manifest = SnapshotManifest::read(dir)?;
        Ok(Snapshot {
            id,
            path: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn includes_data(&self) -> bool {
        self.manifest.data_archive.is_some()
    }
}
