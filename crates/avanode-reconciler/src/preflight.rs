// HOST PREFLIGHT
//
// SAFETY INVARIANTS:
// 1. Preflight only reads; a failed preflight leaves the host untouched
// 2. Every problem is reported at once, not just the first

use std::fs;
use std::path::Path;

use nix::unistd::geteuid;
use tracing::{debug, warn};

use crate::error::DriverError;

/// External programs mutating operations shell out to
pub const REQUIRED_TOOLS: [&str; 3] = ["systemctl", "journalctl", "tar"];

/// Distribution the tool is exercised on
pub const SUPPORTED_DISTRIBUTION: &str = "ubuntu";

const OS_RELEASE: &str = "/etc/os-release";
const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightPolicy {
    pub require_root: bool,
    pub require_systemd: bool,
    pub tools: Vec<String>,
}

impl Default for PreflightPolicy {
    fn default() -> Self {
        PreflightPolicy {
            require_root: true,
            require_systemd: true,
            tools: REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// Blocking: the operation must not start
    pub problems: Vec<String>,

    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }

    /// Turn blocking problems into a precondition error
    pub fn into_result(self) -> Result<Vec<String>, DriverError> {
        if self.problems.is_empty() {
            Ok(self.warnings)
        } else {
            Err(DriverError::Precondition(self.problems.join("; ")))
        }
    }
}

/// `ID` and `VERSION_ID` from an os-release document
pub fn parse_os_release(text: &str) -> (Option<String>, Option<String>) {
    let mut id = None;
    let mut version = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    (id, version)
}

fn distribution_warning(id: Option<&str>, version: Option<&str>) -> Option<String> {
    match id {
        Some(SUPPORTED_DISTRIBUTION) => None,
        Some(other) => Some(format!(
            "running on {} {}; only {} is tested",
            other,
            version.unwrap_or(""),
            SUPPORTED_DISTRIBUTION
        )),
        None => Some("cannot identify the Linux distribution".to_string()),
    }
}

/// Check the host against `policy`.
pub fn check(policy: &PreflightPolicy) -> PreflightReport {
    let mut report = PreflightReport::default();

    if !cfg!(target_os = "linux") {
        report
            .problems
            .push(format!("unsupported OS {}; Linux is required", std::env::consts::OS));
    } else {
        match fs::read_to_string(OS_RELEASE) {
            Ok(text) => {
                let (id, version) = parse_os_release(&text);
                debug!("Distribution {:?} {:?}", id, version);
                report
                    .warnings
                    .extend(distribution_warning(id.as_deref(), version.as_deref()));
            }
            Err(e) => report
                .warnings
                .push(format!("cannot read {}: {}", OS_RELEASE, e)),
        }
    }

    if policy.require_root && !geteuid().is_root() {
        report
            .problems
            .push("root privileges are required (run with sudo)".to_string());
    }

    if policy.require_systemd && !Path::new(SYSTEMD_RUNTIME_DIR).is_dir() {
        report
            .problems
            .push("systemd is not the running service manager".to_string());
    }

    for tool in &policy.tools {
        if let Err(e) = which::which(tool) {
            report
                .problems
                .push(format!("required tool `{}` not found: {}", tool, e));
        }
    }

    for warning in &report.warnings {
        warn!("Preflight: {}", warning);
    }
    report
}
