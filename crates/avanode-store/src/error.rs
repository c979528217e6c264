use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("node identity incomplete, missing: {}", join_paths(.missing))]
    IdentityNotFound { missing: Vec<PathBuf> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("another operation is in progress (lock held at {})", path.display())]
    Locked { path: PathBuf },

    #[error("cannot lock {}: {source}", path.display())]
    LockFailed {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("system user `{0}` does not exist")]
    UnknownUser(String),

    #[error("user database lookup failed: {0}")]
    UserLookup(#[from] nix::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Attach a path to an I/O error
pub(crate) fn at(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
