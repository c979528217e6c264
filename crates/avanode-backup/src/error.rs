use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use avanode_store::{PermissionViolation, StoreError};
use avanode_supervisor::{CommandError, SupervisorError};
use thiserror::Error;

use crate::engine::RestoreStep;
use crate::verify::SnapshotViolation;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("archive command failed: {0}")]
    Archive(#[from] CommandError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("manifest encoding failed: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("refusing to operate on an unsafe layout:\n  {}", join(.0))]
    UnsafeLayout(Vec<PermissionViolation>),

    #[error("required material missing: {}", .0.display())]
    MissingMaterial(PathBuf),

    #[error("snapshot {id} failed verification:\n  {}", join(.violations))]
    Corrupt {
        id: String,
        violations: Vec<SnapshotViolation>,
    },

    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("invalid snapshot id `{0}`")]
    InvalidId(String),

    #[error("snapshot {0} has no data archive")]
    NoDataArchive(String),

    #[error("service did not stay running for {0:?} after start")]
    NotRunning(Duration),

    #[error("injected fault at {0}")]
    InjectedFault(RestoreStep),
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("\n  ")
}

pub(crate) fn at(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}
