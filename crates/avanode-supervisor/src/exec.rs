// EXTERNAL COMMAND RUNNER
// Every shell-out (systemctl, journalctl, tar, the node binary) goes through here
//
// SAFETY INVARIANTS:
// 1. A non-zero exit is always returned as an error, never swallowed
// 2. Arguments are passed as a vector, never through a shell
// 3. A bounded call kills the child when its deadline passes

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Exit code reported when a child was terminated by a signal
pub const SIGNALLED: i32 = -1;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

impl CommandError {
    /// Exit code of the failed command, if it ran at all
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn render_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.as_ref().to_string_lossy());
    }
    rendered
}

/// Run a command and capture its output regardless of exit status.
///
/// Only launch failures and timeouts are errors here; callers that care
/// about the exit code use [`run_checked`].
pub async fn run_captured<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Option<Duration>,
) -> Result<CommandOutput, CommandError> {
    let command = render_command(program, args);
    debug!("exec: {}", command);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let fut = cmd.output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                return Err(CommandError::TimedOut {
                    command,
                    timeout: limit,
                })
            }
        },
        None => fut.await,
    }
    .map_err(|source| CommandError::Spawn {
        command: command.clone(),
        source,
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(SIGNALLED),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a command and fail on any non-zero exit.
pub async fn run_checked<S: AsRef<OsStr>>(
    program: &str,
    args: &[S],
    timeout: Option<Duration>,
) -> Result<CommandOutput, CommandError> {
    let output = run_captured(program, args, timeout).await?;
    if !output.success() {
        return Err(CommandError::Failed {
            command: render_command(program, args),
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}
