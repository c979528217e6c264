// === Snapshot model ===
pub mod snapshot;
pub mod verify;

// === Data archives ===
pub mod archive;

// === Backup, restore, rollback, retention ===
pub mod engine;

pub mod error;

// === Re-exports ===
pub use archive::{DATA_ARCHIVE, DEFAULT_ARCHIVE_TIMEOUT, MIN_PLAUSIBLE_ARCHIVE_BYTES};
pub use engine::{
    BackupEngine, BackupOptions, FatalReport, FaultPlan, RestoreOptions, RestoreOutcome,
    RestoreStep, DEFAULT_SETTLE,
};
pub use error::BackupError;
pub use snapshot::{
    ArchiveEntry, ManifestEntry, Snapshot, SnapshotId, SnapshotManifest, SnapshotReason,
    MANIFEST_FILE,
};
pub use verify::{verify_snapshot_dir, SnapshotViolation, VerifyReport};
