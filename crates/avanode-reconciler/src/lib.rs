// === Host observation and action selection ===
pub mod decision;
pub mod host;

// === Workflows ===
pub mod driver;
pub mod report;

// === External collaborators ===
pub mod installer;
pub mod probe;
pub mod prompt;

pub mod account;
pub mod preflight;
pub mod retry;

pub mod error;

#[cfg(test)]
mod testing;

// === Re-exports ===
pub use account::service_owner;
pub use decision::{offered_actions, reconcile, Action, ActionKind, Decision, Intent, RpcRequest};
pub use driver::{extract_node_id, Driver, DriverSettings};
pub use error::{DriverError, FailureClass, InstallError, ProbeError};
pub use host::{observe, HostPhase, HostState};
pub use installer::{Installer, ReleaseInstaller, BINARY_NAME, DEFAULT_INSTALL_DIR};
pub use preflight::{check as preflight_check, PreflightPolicy, PreflightReport};
pub use probe::{NodeProbe, RpcProbe};
pub use prompt::{AssumeYes, FixedAnswers, Prompter, TerminalPrompter};
pub use report::{FinalState, OperationReport, StatusReport};
pub use retry::RetryPolicy;
