use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use avanode_backup::BackupError;
use avanode_store::StoreError;
use avanode_supervisor::{CommandError, SupervisorError};
use thiserror::Error;

use crate::decision::ActionKind;

/// Coarse failure category, one per non-zero exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Bad flags, unknown snapshot, declined confirmation, action not offered
    UserInput,

    /// Wrong OS, missing privilege or tool, unsafe layout; nothing was mutated
    Precondition,

    /// Service manager, download, archive or node binary call failed
    ExternalCommand,

    /// The operation failed and the host was returned to its prior state
    RolledBack,

    /// Rollback failed too; a human has to look
    Fatal,
}

impl FailureClass {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureClass::UserInput => 2,
            FailureClass::Precondition => 3,
            FailureClass::ExternalCommand => 4,
            FailureClass::RolledBack => 5,
            FailureClass::Fatal => 6,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::UserInput => "input error",
            FailureClass::Precondition => "precondition failed",
            FailureClass::ExternalCommand => "external command failed",
            FailureClass::RolledBack => "rolled back",
            FailureClass::Fatal => "manual intervention required",
        })
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unusable release: {0}")]
    BadRelease(String),

    #[error("node binary not found at {}", .0.display())]
    MissingBinary(PathBuf),

    #[error("identity files did not appear within {0:?}")]
    IdentityTimeout(Duration),

    #[error("identity already present in {}; refusing to generate over it", .0.display())]
    IdentityPresent(PathBuf),
}

impl InstallError {
    /// Worth another attempt: connection trouble or a server-side status
    pub fn is_transient(&self) -> bool {
        match self {
            InstallError::Http(e) => !e.is_builder() && !e.is_decode(),
            InstallError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("RPC request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed RPC response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{reason} (available here: {})", join(.offered))]
    Refused {
        reason: String,
        offered: Vec<ActionKind>,
    },

    #[error("cancelled: {0}")]
    Declined(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("node RPC: {0}")]
    Probe(#[from] ProbeError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("post-condition not met: {0}")]
    Verification(String),

    #[error("could not read an answer: {0}")]
    Prompt(#[source] io::Error),

    #[error("{operation} failed and was rolled back to {}: {reason}", snapshot.display())]
    RolledBack {
        operation: ActionKind,
        reason: String,
        snapshot: PathBuf,
    },

    #[error("{0}")]
    Fatal(String),
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl DriverError {
    pub fn class(&self) -> FailureClass {
        match self {
            DriverError::Refused { .. } | DriverError::Declined(_) | DriverError::Prompt(_) => {
                FailureClass::UserInput
            }
            DriverError::Precondition(_) => FailureClass::Precondition,
            DriverError::Store(e) => match e {
                StoreError::Locked { .. }
                | StoreError::IdentityNotFound { .. }
                | StoreError::InvalidConfig(_)
                | StoreError::UnknownUser(_) => FailureClass::Precondition,
                _ => FailureClass::ExternalCommand,
            },
            DriverError::Backup(e) => match e {
                BackupError::NotFound(_) | BackupError::InvalidId(_) => FailureClass::UserInput,
                BackupError::UnsafeLayout(_)
                | BackupError::MissingMaterial(_)
                | BackupError::Corrupt { .. }
                | BackupError::NoDataArchive(_) => FailureClass::Precondition,
                BackupError::Store(StoreError::Locked { .. }) => FailureClass::Precondition,
                _ => FailureClass::ExternalCommand,
            },
            DriverError::Supervisor(_)
            | DriverError::Install(_)
            | DriverError::Probe(_)
            | DriverError::Io { .. }
            | DriverError::Verification(_) => FailureClass::ExternalCommand,
            DriverError::RolledBack { .. } => FailureClass::RolledBack,
            DriverError::Fatal(_) => FailureClass::Fatal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.class().exit_code()
    }
}

pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> DriverError {
    let path = path.into();
    move |source| DriverError::Io { path, source }
}
