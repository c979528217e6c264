// HOST STATE OBSERVATION
//
// SAFETY INVARIANTS:
// 1. Host state is derived, never persisted; it is recomputed before every decision
// 2. The managed marker in the service definition is the only signal for "managed"
// 3. Observation never mutates the host

use std::fmt;
use std::path::PathBuf;

use avanode_store::{
    identity_presence, read_deployment_record, read_observed_config, DeploymentRecord,
    IdentityPresence, Network, NodeLayout, ObservedConfig, Role, RpcScope,
};
use avanode_supervisor::{exec_program, is_managed, read_unit, ServiceStatus, ServiceSupervisor};
use tracing::{debug, warn};

use crate::error::{io_at, DriverError};
use crate::installer::Installer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPhase {
    /// No unit, no identity, no config
    Uninstalled,

    /// Node material or a unit exists but the unit lacks the managed marker
    InstalledUnmanaged,

    ManagedRunning,

    ManagedStopped,
}

impl HostPhase {
    /// Pure classification from the observed signals.
    pub fn classify(
        managed: bool,
        has_material: bool,
        unit_present: bool,
        service: ServiceStatus,
    ) -> HostPhase {
        if managed {
            if service == ServiceStatus::Running {
                HostPhase::ManagedRunning
            } else {
                HostPhase::ManagedStopped
            }
        } else if has_material || unit_present || service != ServiceStatus::NotInstalled {
            HostPhase::InstalledUnmanaged
        } else {
            HostPhase::Uninstalled
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, HostPhase::ManagedRunning | HostPhase::ManagedStopped)
    }
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostPhase::Uninstalled => "uninstalled",
            HostPhase::InstalledUnmanaged => "installed (unmanaged)",
            HostPhase::ManagedRunning => "managed, running",
            HostPhase::ManagedStopped => "managed, stopped",
        })
    }
}

/// Snapshot of everything the reconciler decides on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostState {
    pub phase: HostPhase,
    pub service: ServiceStatus,
    pub unit_present: bool,
    pub managed: bool,

    /// Binary named by the unit's ExecStart, if a unit exists
    pub exec_path: Option<PathBuf>,

    pub identity: IdentityPresence,
    pub config_present: bool,

    /// What this tool recorded at its last install/upgrade/migrate
    pub record: Option<DeploymentRecord>,

    /// What could be read back from node.json
    pub observed: Option<ObservedConfig>,

    pub binary_version: Option<String>,
}

impl HostState {
    pub fn installed(&self) -> bool {
        self.phase != HostPhase::Uninstalled
    }

    pub fn running(&self) -> bool {
        self.service == ServiceStatus::Running
    }

    pub fn role(&self) -> Option<Role> {
        self.record.as_ref().map(|r| r.role)
    }

    pub fn network(&self) -> Option<Network> {
        self.record
            .as_ref()
            .map(|r| r.network)
            .or_else(|| self.observed.as_ref().and_then(|o| o.network))
    }

    pub fn rpc_scope(&self) -> Option<RpcScope> {
        self.record
            .as_ref()
            .map(|r| r.rpc_scope)
            .or_else(|| self.observed.as_ref().map(|o| o.rpc_scope))
    }

    #[cfg(test)]
    pub(crate) fn for_phase(phase: HostPhase) -> HostState {
        let (managed, service, identity) = match phase {
            HostPhase::Uninstalled => (false, ServiceStatus::NotInstalled, IdentityPresence::Absent),
            HostPhase::InstalledUnmanaged => (false, ServiceStatus::Running, IdentityPresence::Complete),
            HostPhase::ManagedRunning => (true, ServiceStatus::Running, IdentityPresence::Complete),
            HostPhase::ManagedStopped => (true, ServiceStatus::Stopped, IdentityPresence::Complete),
        };
        HostState {
            phase,
            service,
            unit_present: phase != HostPhase::Uninstalled,
            managed,
            exec_path: None,
            identity,
            config_present: phase != HostPhase::Uninstalled,
            record: None,
            observed: None,
            binary_version: None,
        }
    }
}

/// Inspect the filesystem and the service manager.
pub async fn observe(
    layout: &NodeLayout,
    supervisor: &dyn ServiceSupervisor,
    installer: &dyn Installer,
) -> Result<HostState, DriverError> {
    let unit_text = read_unit(layout.unit_path()).map_err(io_at(layout.unit_path()))?;
    let unit_present = unit_text.is_some();
    let managed = unit_text.as_deref().map(is_managed).unwrap_or(false);
    let exec_path = unit_text.as_deref().and_then(exec_program);

    let service = supervisor.is_running().await?;
    let identity = identity_presence(layout);
    let config_present = layout.config_path().is_file();

    let record = read_deployment_record(layout).unwrap_or_else(|e| {
        warn!("Ignoring unreadable deployment record: {}", e);
        None
    });
    let observed = read_observed_config(layout).unwrap_or_else(|e| {
        warn!("Ignoring unreadable node config: {}", e);
        None
    });

    let binary = exec_path
        .clone()
        .unwrap_or_else(|| installer.default_binary());
    let binary_version = installer.binary_version(&binary).await.unwrap_or_else(|e| {
        warn!("Could not query {} --version: {}", binary.display(), e);
        None
    });

    let phase = HostPhase::classify(managed, layout.has_material(), unit_present, service);
    debug!(
        "Observed {}: service {}, identity {:?}, managed {}",
        phase, service, identity, managed
    );

    Ok(HostState {
        phase,
        service,
        unit_present,
        managed,
        exec_path,
        identity,
        config_present,
        record,
        observed,
        binary_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInstaller;
    use avanode_store::{write_config, write_identity, NodeConfig, NodeIdentity};
    use avanode_supervisor::testing::MemorySupervisor;
    use avanode_supervisor::UnitSpec;
    use std::fs;

    #[test]
    fn test_classify_table() {
        use ServiceStatus::*;
        assert_eq!(HostPhase::classify(false, false, false, NotInstalled), HostPhase::Uninstalled);
        assert_eq!(HostPhase::classify(false, true, false, NotInstalled), HostPhase::InstalledUnmanaged);
        assert_eq!(HostPhase::classify(false, false, true, Stopped), HostPhase::InstalledUnmanaged);
        assert_eq!(HostPhase::classify(false, false, false, Running), HostPhase::InstalledUnmanaged);
        assert_eq!(HostPhase::classify(true, true, true, Running), HostPhase::ManagedRunning);
        assert_eq!(HostPhase::classify(true, true, true, Stopped), HostPhase::ManagedStopped);
    }

    fn unit(layout: &NodeLayout) -> UnitSpec {
        UnitSpec {
            description: "AvalancheGo".to_string(),
            user: "avalanche".to_string(),
            group: "avalanche".to_string(),
            working_dir: layout.root().to_path_buf(),
            exec: PathBuf::from("/usr/local/bin/avalanchego"),
            args: vec![],
            limit_nofile: 32768,
        }
    }

    fn populate(layout: &NodeLayout) {
        layout.ensure_directory_layout(None).unwrap();
        write_identity(
            layout,
            &NodeIdentity::new(b"cert".to_vec(), b"key".to_vec(), b"signer".to_vec()),
            None,
        )
        .unwrap();
        let config = NodeConfig::for_role(Role::Validator, Network::Testnet, layout);
        write_config(layout, &config, &DeploymentRecord::for_config(&config, None), None).unwrap();
    }

    #[tokio::test]
    async fn test_observe_empty_host() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("node.service"));
        let supervisor = MemorySupervisor::new(ServiceStatus::NotInstalled);
        let installer = FakeInstaller::new(tmp.path().join("bin"));

        let state = observe(&layout, &supervisor, &installer).await.unwrap();
        assert_eq!(state.phase, HostPhase::Uninstalled);
        assert!(!state.installed());
        assert_eq!(state.identity, IdentityPresence::Absent);
    }

    #[tokio::test]
    async fn test_identical_layout_without_marker_is_unmanaged() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("node.service"));
        populate(&layout);
        let managed_text = unit(&layout).render();
        let hand_written = managed_text.replace(avanode_supervisor::MANAGED_MARKER, "# mine");
        fs::write(layout.unit_path(), hand_written).unwrap();

        let supervisor = MemorySupervisor::running();
        let installer = FakeInstaller::new(tmp.path().join("bin"));
        let state = observe(&layout, &supervisor, &installer).await.unwrap();
        assert_eq!(state.phase, HostPhase::InstalledUnmanaged);
        assert_eq!(state.exec_path, Some(PathBuf::from("/usr/local/bin/avalanchego")));
        assert_eq!(state.network(), Some(Network::Testnet));

        fs::write(layout.unit_path(), managed_text).unwrap();
        let state = observe(&layout, &supervisor, &installer).await.unwrap();
        assert_eq!(state.phase, HostPhase::ManagedRunning);
        assert_eq!(state.role(), Some(Role::Validator));
    }
}
