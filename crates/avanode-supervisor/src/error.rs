use std::time::Duration;

use thiserror::Error;

use crate::exec::CommandError;

/// Failure of a service manager call
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service {operation} failed with exit code {exit_code}: {detail}")]
    CommandFailed {
        operation: String,
        exit_code: i32,
        detail: String,
    },

    #[error("service {operation} did not complete within {}s", waited.as_secs())]
    Timeout { operation: String, waited: Duration },

    #[error("could not invoke service manager for {operation}: {source}")]
    Unavailable {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Wrap a command failure with the supervisor operation it belonged to
    pub fn from_command(operation: &str, err: CommandError) -> Self {
        match err {
            CommandError::Failed {
                exit_code, stderr, ..
            } => SupervisorError::CommandFailed {
                operation: operation.to_string(),
                exit_code,
                detail: stderr,
            },
            CommandError::TimedOut { timeout, .. } => SupervisorError::Timeout {
                operation: operation.to_string(),
                waited: timeout,
            },
            CommandError::Spawn { source, .. } => SupervisorError::Unavailable {
                operation: operation.to_string(),
                source,
            },
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            SupervisorError::CommandFailed { operation, .. }
            | SupervisorError::Timeout { operation, .. }
            | SupervisorError::Unavailable { operation, .. } => operation,
        }
    }
}
