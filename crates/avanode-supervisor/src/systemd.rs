use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::SupervisorError;
use crate::exec::{run_captured, run_checked};
use crate::supervisor::{
    wait_until_stopped_since, ServiceStatus, ServiceSupervisor, DEFAULT_POLL_INTERVAL,
    DEFAULT_STOP_TIMEOUT,
};

const SYSTEMCTL: &str = "systemctl";
const JOURNALCTL: &str = "journalctl";

/// Bound on quick systemctl queries (show, daemon-reload, enable)
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// systemd-backed supervisor for a single unit
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    unit: String,
    stop_timeout: Duration,
    poll_interval: Duration,
}

impl SystemdSupervisor {
    pub fn new(unit: impl Into<String>) -> Self {
        SystemdSupervisor {
            unit: unit.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    async fn systemctl(
        &self,
        operation: &str,
        verb: &str,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        run_checked(SYSTEMCTL, &[verb, self.unit.as_str()], Some(timeout))
            .await
            .map(|_| ())
            .map_err(|e| SupervisorError::from_command(operation, e))
    }
}

/// Interpret `systemctl show -p LoadState -p ActiveState` output.
pub fn parse_show_output(output: &str) -> ServiceStatus {
    let mut load_state = "";
    let mut active_state = "";
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("LoadState=") {
            load_state = value.trim();
        } else if let Some(value) = line.strip_prefix("ActiveState=") {
            active_state = value.trim();
        }
    }

    if load_state == "not-found" || load_state.is_empty() {
        return ServiceStatus::NotInstalled;
    }

    match active_state {
        "active" | "activating" | "reloading" | "deactivating" => ServiceStatus::Running,
        _ => ServiceStatus::Stopped,
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    fn unit_name(&self) -> &str {
        &self.unit
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        info!("Starting {}", self.unit);
        self.systemctl("start", "start", QUERY_TIMEOUT).await
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        info!("Stopping {}", self.unit);
        // one budget covers the stop request and the wait for exit
        let started = Instant::now();
        self.systemctl("stop", "stop", self.stop_timeout).await?;
        wait_until_stopped_since(self, started, self.stop_timeout, self.poll_interval).await
    }

    async fn restart(&self) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.start().await
    }

    async fn is_running(&self) -> Result<ServiceStatus, SupervisorError> {
        let output = run_checked(
            SYSTEMCTL,
            &["show", "-p", "LoadState", "-p", "ActiveState", self.unit.as_str()],
            Some(QUERY_TIMEOUT),
        )
        .await
        .map_err(|e| SupervisorError::from_command("status", e))?;
        Ok(parse_show_output(&output.stdout))
    }

    async fn tail_logs(&self, lines: usize) -> Result<Vec<String>, SupervisorError> {
        let count = lines.to_string();
        let output = run_captured(
            JOURNALCTL,
            &["-u", self.unit.as_str(), "-n", count.as_str(), "--no-pager", "-o", "cat"],
            Some(QUERY_TIMEOUT),
        )
        .await
        .map_err(|e| SupervisorError::from_command("logs", e))?;

        if !output.success() {
            warn!("journalctl exited with {} for {}", output.exit_code, self.unit);
            return Err(SupervisorError::CommandFailed {
                operation: "logs".to_string(),
                exit_code: output.exit_code,
                detail: output.stderr,
            });
        }

        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    async fn reload_definitions(&self) -> Result<(), SupervisorError> {
        run_checked(SYSTEMCTL, &["daemon-reload"], Some(QUERY_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|e| SupervisorError::from_command("daemon-reload", e))
    }

    async fn enable(&self) -> Result<(), SupervisorError> {
        self.systemctl("enable", "enable", QUERY_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_active_unit() {
        let out = "LoadState=loaded\nActiveState=active\n";
        assert_eq!(parse_show_output(out), ServiceStatus::Running);
    }

    #[test]
    fn test_parse_inactive_and_failed_units() {
        assert_eq!(
            parse_show_output("LoadState=loaded\nActiveState=inactive\n"),
            ServiceStatus::Stopped
        );
        assert_eq!(
            parse_show_output("ActiveState=failed\nLoadState=loaded\n"),
            ServiceStatus::Stopped
        );
    }

    #[test]
    fn test_parse_missing_unit() {
        let out = "LoadState=not-found\nActiveState=inactive\n";
        assert_eq!(parse_show_output(out), ServiceStatus::NotInstalled);
        assert_eq!(parse_show_output(""), ServiceStatus::NotInstalled);
    }

    #[test]
    fn test_builder_overrides_timeouts() {
        let sup = SystemdSupervisor::new("avalanchego")
            .with_stop_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(sup.unit_name(), "avalanchego");
        assert_eq!(sup.stop_timeout, Duration::from_secs(5));
    }
}
