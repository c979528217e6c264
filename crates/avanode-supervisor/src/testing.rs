//! In-memory supervisor for exercising workflows without a service manager.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SupervisorError;
use crate::supervisor::{ServiceStatus, ServiceSupervisor};

#[derive(Debug)]
struct Inner {
    status: ServiceStatus,
    logs: Vec<String>,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, u32>,
    crashes_on_start: u32,
}

/// Records calls and models status transitions of a single unit.
#[derive(Debug)]
pub struct MemorySupervisor {
    unit: String,
    inner: Mutex<Inner>,
}

impl MemorySupervisor {
    pub fn new(status: ServiceStatus) -> Self {
        MemorySupervisor {
            unit: "avalanchego".to_string(),
            inner: Mutex::new(Inner {
                status,
                logs: Vec::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                crashes_on_start: 0,
            }),
        }
    }

    pub fn running() -> Self {
        Self::new(ServiceStatus::Running)
    }

    pub fn with_logs(self, lines: &[&str]) -> Self {
        self.inner.lock().logs = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Make the next `times` calls of `operation` fail with exit code 1.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.inner.lock().failures.insert(operation, times);
    }

    /// The next `times` starts succeed but the process dies immediately.
    pub fn crash_on_start(&self, times: u32) {
        self.inner.lock().crashes_on_start = times;
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: ServiceStatus) {
        self.inner.lock().status = status;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.lock().calls.clone()
    }

    fn enter(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, Inner>, SupervisorError> {
        let mut inner = self.inner.lock();
        inner.calls.push(operation);
        if let Some(remaining) = inner.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SupervisorError::CommandFailed {
                    operation: operation.to_string(),
                    exit_code: 1,
                    detail: "injected failure".to_string(),
                });
            }
        }
        Ok(inner)
    }
}

fn not_loaded(operation: &str) -> SupervisorError {
    SupervisorError::CommandFailed {
        operation: operation.to_string(),
        exit_code: 5,
        detail: "Unit not loaded".to_string(),
    }
}

#[async_trait]
impl ServiceSupervisor for MemorySupervisor {
    fn unit_name(&self) -> &str {
        &self.unit
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.enter("start")?;
        if inner.status == ServiceStatus::NotInstalled {
            return Err(not_loaded("start"));
        }
        if inner.crashes_on_start > 0 {
            inner.crashes_on_start -= 1;
            inner.status = ServiceStatus::Stopped;
        } else {
            inner.status = ServiceStatus::Running;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        let mut inner = self.enter("stop")?;
        if inner.status != ServiceStatus::NotInstalled {
            inner.status = ServiceStatus::Stopped;
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.start().await
    }

    async fn is_running(&self) -> Result<ServiceStatus, SupervisorError> {
        let inner = self.enter("status")?;
        Ok(inner.status)
    }

    async fn tail_logs(&self, lines: usize) -> Result<Vec<String>, SupervisorError> {
        let inner = self.enter("logs")?;
        let skip = inner.logs.len().saturating_sub(lines);
        Ok(inner.logs[skip..].to_vec())
    }

    async fn reload_definitions(&self) -> Result<(), SupervisorError> {
        let mut inner = self.enter("daemon-reload")?;
        if inner.status == ServiceStatus::NotInstalled {
            inner.status = ServiceStatus::Stopped;
        }
        Ok(())
    }

    async fn enable(&self) -> Result<(), SupervisorError> {
        let inner = self.enter("enable")?;
        if inner.status == ServiceStatus::NotInstalled {
            return Err(not_loaded("enable"));
        }
        Ok(())
    }
}
