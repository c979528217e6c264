// === Service manager contract ===
pub mod error;
pub mod supervisor;

// === Backends ===
pub mod systemd;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// === Shell-out plumbing and unit files ===
pub mod exec;
pub mod unit;

// === Re-exports ===
pub use error::SupervisorError;
pub use exec::{run_captured, run_checked, CommandError, CommandOutput};
pub use supervisor::{
    confirm_running, wait_until_stopped, wait_until_stopped_since, ServiceStatus,
    ServiceSupervisor, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT,
};
pub use systemd::SystemdSupervisor;
pub use unit::{exec_program, is_managed, read_unit, write_unit, UnitSpec, MANAGED_MARKER};
