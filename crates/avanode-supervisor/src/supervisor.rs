// PROCESS SUPERVISOR CONTRACT
//
// SAFETY INVARIANTS:
// 1. stop() and restart() return success only after the process has exited
// 2. Waits are bounded; exceeding the bound is a Timeout error, never a hang
// 3. No state is cached between calls beyond the unit name

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SupervisorError;

/// Default bound on waiting for the node to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between status polls while waiting
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Observed runtime status of the managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Process is up (or activating)
    Running,

    /// Unit is known to the service manager but not running
    Stopped,

    /// Service manager has no unit under this name
    NotInstalled,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::NotInstalled => "not installed",
        };
        f.write_str(text)
    }
}

/// Abstract handle on the host's service manager.
///
/// systemd is the reference backend; any manager that can honour the
/// blocking semantics of `stop`/`restart` satisfies the contract.
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    /// Well-known unit name this supervisor acts on
    fn unit_name(&self) -> &str;

    async fn start(&self) -> Result<(), SupervisorError>;

    /// Stop the service and block until it has exited.
    async fn stop(&self) -> Result<(), SupervisorError>;

    /// Stop (blocking until exit) and start again.
    async fn restart(&self) -> Result<(), SupervisorError>;

    async fn is_running(&self) -> Result<ServiceStatus, SupervisorError>;

    /// Last `lines` lines of the service log, oldest first.
    /// Diagnostic only.
    async fn tail_logs(&self, lines: usize) -> Result<Vec<String>, SupervisorError>;

    /// Re-read service definitions after the unit file changed.
    async fn reload_definitions(&self) -> Result<(), SupervisorError>;

    /// Mark the service to start at boot.
    async fn enable(&self) -> Result<(), SupervisorError>;
}

/// Poll `is_running` until the service is no longer running.
pub async fn wait_until_stopped<S: ServiceSupervisor + ?Sized>(
    supervisor: &S,
    timeout: Duration,
    poll: Duration,
) -> Result<(), SupervisorError> {
    wait_until_stopped_since(supervisor, Instant::now(), timeout, poll).await
}

/// As [`wait_until_stopped`], with the bound counted from `started` so time
/// already spent on the stop request comes out of the same budget.
pub async fn wait_until_stopped_since<S: ServiceSupervisor + ?Sized>(
    supervisor: &S,
    started: Instant,
    timeout: Duration,
    poll: Duration,
) -> Result<(), SupervisorError> {
    loop {
        let status = supervisor.is_running().await?;
        if status != ServiceStatus::Running {
            debug!("{} reached {} after {:?}", supervisor.unit_name(), status, started.elapsed());
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(SupervisorError::Timeout {
                operation: "stop".to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll).await;
    }
}

/// Confirm the service stays up for a settle window after a start.
///
/// A node that crash-loops on a bad identity or config will usually fall
/// over within a few seconds; a single status sample right after `start`
/// would miss that.
pub async fn confirm_running<S: ServiceSupervisor + ?Sized>(
    supervisor: &S,
    settle: Duration,
    poll: Duration,
) -> Result<bool, SupervisorError> {
    let started = Instant::now();
    loop {
        if supervisor.is_running().await? != ServiceStatus::Running {
            return Ok(false);
        }
        if started.elapsed() >= settle {
            return Ok(true);
        }
        tokio::time::sleep(poll.min(settle)).await;
    }
}
