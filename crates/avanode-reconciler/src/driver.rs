// DEPLOYMENT DRIVER
//
// SAFETY INVARIANTS:
// 1. Every mutating operation runs under the operation lock
// 2. Host state is observed after the lock is taken, never before
// 3. Upgrade, migrate and identity regeneration snapshot before their first mutation
// 4. A failed operation ends cleaned up, rolled back, or reported fatal with a manual path
// 5. Migrate never writes identity material
// 6. Disruptive steps run only after the operator confirmed them

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use avanode_backup::{
    BackupEngine, BackupError, BackupOptions, FaultPlan, RestoreOptions, RestoreOutcome, Snapshot,
    SnapshotId, SnapshotReason, VerifyReport,
};
use avanode_store::{
    fix_permissions, identity_presence, launch_args, read_identity, verify_permissions,
    write_config, DeploymentRecord, IdentityPresence, NodeConfig, NodeIdentity, NodeLayout,
    OperationLock, Ownership,
};
use avanode_supervisor::{confirm_running, write_unit, ServiceSupervisor, UnitSpec};
use tracing::{debug, error, info, warn};

use crate::decision::{offered_actions, reconcile, Action, ActionKind, Intent};
use crate::error::{io_at, DriverError};
use crate::host::{self, HostState};
use crate::installer::Installer;
use crate::probe::{wait_for_rpc, NodeProbe};
use crate::prompt::Prompter;
use crate::report::{OperationReport, StatusReport};

const NODE_ID_PREFIX: &str = "NodeID-";

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// System account the node runs as
    pub service_user: String,

    /// Owner applied to node material; `None` leaves ownership alone
    pub owner: Option<Ownership>,

    /// How long a started service must stay up to count as running
    pub settle: Duration,
    pub poll: Duration,

    /// Bound on waiting for the node's HTTP API after a start
    pub rpc_timeout: Duration,

    /// Bound on each tar run over the data directory
    pub archive_timeout: Duration,

    pub limit_nofile: u64,
    pub log_tail_lines: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            service_user: "avalanche".to_string(),
            owner: None,
            settle: avanode_backup::DEFAULT_SETTLE,
            poll: avanode_supervisor::DEFAULT_POLL_INTERVAL,
            rpc_timeout: Duration::from_secs(120),
            archive_timeout: avanode_backup::DEFAULT_ARCHIVE_TIMEOUT,
            limit_nofile: 32768,
            log_tail_lines: 200,
        }
    }
}

/// Executes operator intents against one host
pub struct Driver {
    layout: NodeLayout,
    supervisor: Arc<dyn ServiceSupervisor>,
    installer: Arc<dyn Installer>,
    probe: Arc<dyn NodeProbe>,
    prompter: Arc<dyn Prompter>,
    engine: BackupEngine,
    settings: DriverSettings,
}

impl Driver {
    pub fn new(
        layout: NodeLayout,
        supervisor: Arc<dyn ServiceSupervisor>,
        installer: Arc<dyn Installer>,
        probe: Arc<dyn NodeProbe>,
        prompter: Arc<dyn Prompter>,
        settings: DriverSettings,
    ) -> Self {
        let engine = BackupEngine::new(layout.clone(), supervisor.clone())
            .with_owner(settings.owner)
            .with_settle(settings.settle, settings.poll)
            .with_archive_timeout(settings.archive_timeout);
        Driver {
            layout,
            supervisor,
            installer,
            probe,
            prompter,
            engine,
            settings,
        }
    }

    /// Inject restore faults (drills)
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.engine = self.engine.with_faults(faults);
        self
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn engine(&self) -> &BackupEngine {
        &self.engine
    }

    pub async fn observe(&self) -> Result<HostState, DriverError> {
        host::observe(&self.layout, self.supervisor.as_ref(), self.installer.as_ref()).await
    }

    // === Entry point ===

    /// Lock, observe, decide, act.
    pub async fn execute(&self, intent: Intent) -> Result<OperationReport, DriverError> {
        let root_existed = self.layout.root().exists();
        let lock = OperationLock::acquire(&self.layout)?;

        let result = self.run(&lock, intent, root_existed).await;
        if !root_existed {
            self.forget_unused_root();
        }
        drop(lock);
        result
    }

    async fn run(
        &self,
        lock: &OperationLock,
        intent: Intent,
        root_existed: bool,
    ) -> Result<OperationReport, DriverError> {
        let state = self.observe().await?;
        info!("Host is {}", state.phase);

        let decision = reconcile(&state, &intent, &self.layout);
        for warning in &decision.warnings {
            warn!("{}", warning);
        }

        let report = match decision.action {
            Action::Install { config, version } => {
                self.install(&state, &config, version.as_deref(), root_existed)
                    .await?
            }
            Action::Upgrade { config, version } => {
                self.upgrade(lock, &state, config.as_ref(), version.as_deref())
                    .await?
            }
            Action::Migrate { config } => self.migrate(lock, &state, &config).await?,
            Action::Backup { include_data } => self.backup(lock, &state, include_data).await?,
            Action::Restore {
                snapshot,
                restore_data,
            } => self.restore(lock, &snapshot, restore_data).await?,
            Action::RegenerateIdentity => self.regenerate_identity(lock, &state).await?,
            Action::Cancel => {
                OperationReport::succeeded(ActionKind::Cancel).note("nothing was changed")
            }
            Action::Refuse { reason, offered } => {
                return Err(DriverError::Refused { reason, offered })
            }
        };

        Ok(decision
            .warnings
            .into_iter()
            .fold(report, |report, warning| report.note(warning)))
    }

    /// Drop a root directory that exists only because the lock file needed one.
    fn forget_unused_root(&self) {
        let root = self.layout.root();
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        let lock_path = self.layout.lock_path();
        let only_lock = entries
            .filter_map(|e| e.ok())
            .all(|e| e.path() == lock_path);
        if only_lock {
            match fs::remove_dir_all(root) {
                Ok(()) => debug!("Removed {} (held only the lock)", root.display()),
                Err(e) => debug!("Could not remove {}: {}", root.display(), e),
            }
        }
    }

    fn confirm(&self, operation: ActionKind, question: &str) -> Result<(), DriverError> {
        if self.prompter.confirm(question).map_err(DriverError::Prompt)? {
            Ok(())
        } else {
            Err(DriverError::Declined(format!("{} was not confirmed", operation)))
        }
    }

    // === Shared steps ===

    fn binary_for(&self, state: &HostState) -> PathBuf {
        state
            .exec_path
            .clone()
            .unwrap_or_else(|| self.installer.default_binary())
    }

    fn unit_spec(&self, binary: &Path) -> UnitSpec {
        UnitSpec {
            description: "AvalancheGo node".to_string(),
            user: self.settings.service_user.clone(),
            group: self.settings.service_user.clone(),
            working_dir: self.layout.root().to_path_buf(),
            exec: binary.to_path_buf(),
            args: launch_args(&self.layout),
            limit_nofile: self.settings.limit_nofile,
        }
    }

    async fn install_unit(&self, binary: &Path) -> Result<(), DriverError> {
        let unit_path = self.layout.unit_path();
        write_unit(unit_path, &self.unit_spec(binary).render()).map_err(io_at(unit_path))?;
        self.supervisor.reload_definitions().await?;
        info!("Service definition written to {}", unit_path.display());
        Ok(())
    }

    /// Reset modes and owner, then refuse to go on if anything is still exposed.
    fn secure_material(&self) -> Result<(), DriverError> {
        fix_permissions(&self.layout, self.settings.owner)?;
        let violations = verify_permissions(&self.layout, self.settings.owner)?;
        if !violations.is_empty() {
            let listed: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
            return Err(DriverError::Verification(format!(
                "unsafe permissions remain: {}",
                listed.join("; ")
            )));
        }
        Ok(())
    }

    /// Service stays up through the settle window and the node answers RPC.
    async fn verify_service(&self) -> Result<String, DriverError> {
        let up = confirm_running(self.supervisor.as_ref(), self.settings.settle, self.settings.poll)
            .await?;
        if !up {
            return Err(DriverError::Verification(format!(
                "{} did not stay running for {:?}",
                self.supervisor.unit_name(),
                self.settings.settle
            )));
        }
        wait_for_rpc(self.probe.as_ref(), self.settings.rpc_timeout, self.settings.poll)
            .await
            .map_err(|e| {
                DriverError::Verification(format!(
                    "node did not answer RPC within {:?}: {}",
                    self.settings.rpc_timeout, e
                ))
            })
    }

    async fn discover_node_id(&self) -> Option<String> {
        match self.supervisor.tail_logs(self.settings.log_tail_lines).await {
            Ok(lines) => {
                if let Some(id) = extract_node_id(&lines) {
                    return Some(id);
                }
            }
            Err(e) => debug!("Service log unavailable: {}", e),
        }
        match self.probe.node_id().await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Could not determine the NodeID: {}", e);
                None
            }
        }
    }

    /// Answer a failed operation by returning the host to `snapshot`.
    async fn roll_back(
        &self,
        lock: &OperationLock,
        operation: ActionKind,
        failure: DriverError,
        snapshot: &Snapshot,
        swapped_binary: Option<&Path>,
    ) -> DriverError {
        error!("{} failed: {}", operation, failure);

        if let Some(binary) = swapped_binary {
            if let Err(e) = self.supervisor.stop().await {
                warn!("Stop before binary restore failed: {}", e);
            }
            match self.installer.restore_previous(binary).await {
                Ok(true) => {}
                Ok(false) => warn!("No previous binary to restore at {}", binary.display()),
                Err(e) => warn!("Restoring the previous binary failed: {}", e),
            }
        }

        match self.engine.rollback(lock, snapshot).await {
            Ok(()) => DriverError::RolledBack {
                operation,
                reason: failure.to_string(),
                snapshot: snapshot.path.clone(),
            },
            Err(rollback_error) => {
                let tail = self
                    .supervisor
                    .tail_logs(self.settings.log_tail_lines)
                    .await
                    .unwrap_or_default();
                DriverError::Fatal(fatal_message(
                    operation,
                    &failure,
                    &rollback_error,
                    &snapshot.path,
                    &tail,
                ))
            }
        }
    }

    // === Install ===

    async fn install(
        &self,
        state: &HostState,
        config: &NodeConfig,
        version: Option<&str>,
        root_existed: bool,
    ) -> Result<OperationReport, DriverError> {
        let binary = self.installer.default_binary();
        let binary_existed = binary.exists();
        let mut created = Vec::new();
        let mut swapped = false;

        match self
            .install_steps(&binary, config, version, &mut created, &mut swapped)
            .await
        {
            Ok(report) => Ok(report),
            Err(e) => {
                error!("Install failed: {}", e);
                self.clean_failed_install(
                    &binary,
                    binary_existed && swapped,
                    binary_existed,
                    state.unit_present,
                    &created,
                    root_existed,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn install_steps(
        &self,
        binary: &Path,
        config: &NodeConfig,
        version: Option<&str>,
        created: &mut Vec<PathBuf>,
        swapped: &mut bool,
    ) -> Result<OperationReport, DriverError> {
        created.extend(self.layout.ensure_directory_layout(self.settings.owner)?);

        let installed = self.installer.install_binary(binary, version).await?;
        *swapped = true;
        let record = DeploymentRecord::for_config(config, Some(installed.clone()));
        write_config(&self.layout, config, &record, self.settings.owner)?;

        if identity_presence(&self.layout) == IdentityPresence::Absent {
            self.installer.generate_identity(binary, &self.layout).await?;
        }
        self.secure_material()?;

        self.install_unit(binary).await?;
        self.supervisor.enable().await?;
        self.supervisor.start().await?;
        self.verify_service().await?;

        let mut report = OperationReport::succeeded(ActionKind::Install)
            .note(format!("{} node on {}", config.role, config.network))
            .note(format!("RPC {} on port {}", config.rpc_scope, config.http_port));
        report.version = Some(installed);
        report.node_id = self.discover_node_id().await;
        Ok(report)
    }

    /// Remove whatever a failed install put on the host.
    async fn clean_failed_install(
        &self,
        binary: &Path,
        binary_replaced: bool,
        binary_existed: bool,
        unit_existed: bool,
        created: &[PathBuf],
        root_existed: bool,
    ) {
        warn!("Removing partial install");
        if let Err(e) = self.supervisor.stop().await {
            debug!("Stop during cleanup: {}", e);
        }

        if !unit_existed {
            remove_if_present(self.layout.unit_path());
            if let Err(e) = self.supervisor.reload_definitions().await {
                warn!("Reload after removing the unit failed: {}", e);
            }
        }

        if binary_replaced {
            match self.installer.restore_previous(binary).await {
                Ok(true) => {}
                Ok(false) => warn!("No previous binary to restore at {}", binary.display()),
                Err(e) => warn!("Restoring the previous binary failed: {}", e),
            }
        } else if !binary_existed {
            if let Err(e) = self.installer.remove_binary(binary).await {
                warn!("Could not remove {}: {}", binary.display(), e);
            }
        }

        // the host was uninstalled, so all material is ours
        let material = self.layout.identity_paths().into_iter().chain([
            self.layout.config_path(),
            self.layout.deployment_record_path(),
            self.layout.c_chain_config_path(),
        ]);
        for path in material {
            remove_if_present(&path);
        }

        let dirs: Vec<&Path> = if root_existed {
            created.iter().rev().map(PathBuf::as_path).collect()
        } else {
            vec![self.layout.root()]
        };
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => info!("Removed {}", dir.display()),
                Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
            }
        }
    }

    // === Upgrade ===

    async fn upgrade(
        &self,
        lock: &OperationLock,
        state: &HostState,
        config: Option<&NodeConfig>,
        version: Option<&str>,
    ) -> Result<OperationReport, DriverError> {
        let binary = self.binary_for(state);
        self.confirm(
            ActionKind::Upgrade,
            &format!(
                "Upgrade {} from {} to {}? The node is stopped while the binary is replaced.",
                self.supervisor.unit_name(),
                state.binary_version.as_deref().unwrap_or("an unknown version"),
                version.unwrap_or("the latest release")
            ),
        )?;

        let pre = self
            .engine
            .backup(
                lock,
                BackupOptions {
                    include_data: false,
                    reason: SnapshotReason::PreUpgrade,
                },
            )
            .await?;
        info!("Pre-upgrade snapshot {}", pre.id);

        let mut swapped = false;
        match self.upgrade_steps(&binary, config, version, &mut swapped).await {
            Ok(installed) => {
                let mut report =
                    OperationReport::succeeded(ActionKind::Upgrade).with_snapshot(&pre.path);
                if let Some(before) = &state.binary_version {
                    report = report.note(format!("upgraded from {}", before));
                }
                report.version = Some(installed);
                Ok(report)
            }
            Err(e) => {
                let swapped_binary = swapped.then_some(binary.as_path());
                Err(self
                    .roll_back(lock, ActionKind::Upgrade, e, &pre, swapped_binary)
                    .await)
            }
        }
    }

    async fn upgrade_steps(
        &self,
        binary: &Path,
        config: Option<&NodeConfig>,
        version: Option<&str>,
        swapped: &mut bool,
    ) -> Result<String, DriverError> {
        self.supervisor.stop().await?;
        let installed = self.installer.install_binary(binary, version).await?;
        *swapped = true;

        // unmanaged deployments keep their own config, unit and ownership
        if let Some(config) = config {
            let record = DeploymentRecord::for_config(config, Some(installed.clone()));
            write_config(&self.layout, config, &record, self.settings.owner)?;
            self.install_unit(binary).await?;
            self.secure_material()?;
        }

        self.supervisor.start().await?;
        self.verify_service().await?;
        Ok(installed)
    }

    // === Migrate ===

    async fn migrate(
        &self,
        lock: &OperationLock,
        state: &HostState,
        config: &NodeConfig,
    ) -> Result<OperationReport, DriverError> {
        self.confirm(
            ActionKind::Migrate,
            &format!(
                "Take over this deployment as a managed {} node on {}? {} is restarted with a regenerated config; the existing identity is kept.",
                config.role,
                config.network,
                self.supervisor.unit_name()
            ),
        )?;

        let before = read_identity(&self.layout)?;
        let pre = self
            .engine
            .backup(
                lock,
                BackupOptions {
                    include_data: false,
                    reason: SnapshotReason::PreMigrate,
                },
            )
            .await?;
        info!("Pre-migrate snapshot {}", pre.id);

        match self.migrate_steps(state, config, &before).await {
            Ok((version, node_id)) => {
                let mut report = OperationReport::succeeded(ActionKind::Migrate)
                    .with_snapshot(&pre.path)
                    .note("existing identity carried forward");
                report.version = version;
                report.node_id = node_id;
                Ok(report)
            }
            Err(e) => Err(self.roll_back(lock, ActionKind::Migrate, e, &pre, None).await),
        }
    }

    async fn migrate_steps(
        &self,
        state: &HostState,
        config: &NodeConfig,
        before: &NodeIdentity,
    ) -> Result<(Option<String>, Option<String>), DriverError> {
        if state.running() {
            self.supervisor.stop().await?;
        }
        self.layout.ensure_directory_layout(self.settings.owner)?;

        let (binary, version) = match state.exec_path.clone().filter(|p| p.is_file()) {
            Some(binary) => (binary, state.binary_version.clone()),
            None => {
                let binary = self.installer.default_binary();
                let installed = self.installer.install_binary(&binary, None).await?;
                (binary, Some(installed))
            }
        };

        let record = DeploymentRecord::for_config(config, version.clone());
        write_config(&self.layout, config, &record, self.settings.owner)?;
        self.install_unit(&binary).await?;
        self.supervisor.enable().await?;
        self.secure_material()?;
        self.supervisor.start().await?;
        self.verify_service().await?;

        let after = read_identity(&self.layout)?;
        if !same_identity(before, &after) {
            return Err(DriverError::Verification(
                "node identity changed during migrate".to_string(),
            ));
        }
        Ok((version, self.discover_node_id().await))
    }

    // === Backup ===

    async fn backup(
        &self,
        lock: &OperationLock,
        state: &HostState,
        include_data: bool,
    ) -> Result<OperationReport, DriverError> {
        let options = BackupOptions {
            include_data,
            reason: SnapshotReason::Manual,
        };
        if !(include_data && state.running()) {
            let snapshot = self.engine.backup(lock, options).await?;
            return Ok(OperationReport::succeeded(ActionKind::Backup).with_snapshot(&snapshot.path));
        }

        self.confirm(
            ActionKind::Backup,
            &format!(
                "Archiving the data directory needs {} stopped until the archive is written. Stop it now?",
                self.supervisor.unit_name()
            ),
        )?;
        self.supervisor.stop().await?;
        let snapshot = self.engine.backup(lock, options).await;
        let restarted = self.restart_after_pause().await;
        let snapshot = snapshot?;
        restarted?;

        Ok(OperationReport::succeeded(ActionKind::Backup)
            .with_snapshot(&snapshot.path)
            .note("service was stopped while the data directory was archived"))
    }

    async fn restart_after_pause(&self) -> Result<(), DriverError> {
        self.supervisor.start().await?;
        let up = confirm_running(self.supervisor.as_ref(), self.settings.settle, self.settings.poll)
            .await?;
        if !up {
            return Err(DriverError::Verification(format!(
                "{} did not come back after the data archive",
                self.supervisor.unit_name()
            )));
        }
        Ok(())
    }

    // === Restore ===

    async fn restore(
        &self,
        lock: &OperationLock,
        id: &SnapshotId,
        restore_data: bool,
    ) -> Result<OperationReport, DriverError> {
        let target = self.engine.open(id)?;
        let data_note = if restore_data {
            " The data directory is replaced too."
        } else {
            ""
        };
        self.confirm(
            ActionKind::Restore,
            &format!(
                "Replace the live identity and config with snapshot {} ({})? {} is restarted; if the snapshot holds another identity the NodeID changes.{}",
                id,
                target.manifest.reason,
                self.supervisor.unit_name(),
                data_note
            ),
        )?;

        match self
            .engine
            .restore(lock, id, RestoreOptions { restore_data })
            .await?
        {
            RestoreOutcome::Restored {
                snapshot,
                pre_restore,
            } => Ok(OperationReport::succeeded(ActionKind::Restore)
                .with_snapshot(&snapshot.path)
                .with_snapshot(&pre_restore.path)
                .note(format!("state before the restore is kept in {}", pre_restore.id))),
            RestoreOutcome::RolledBack {
                reason,
                failed_step,
                pre_restore,
            } => Err(DriverError::RolledBack {
                operation: ActionKind::Restore,
                reason: format!("{} failed: {}", failed_step, reason),
                snapshot: pre_restore.path,
            }),
            RestoreOutcome::Fatal(report) => Err(DriverError::Fatal(report.to_string())),
        }
    }

    // === Identity regeneration ===

    async fn regenerate_identity(
        &self,
        lock: &OperationLock,
        state: &HostState,
    ) -> Result<OperationReport, DriverError> {
        self.confirm(
            ActionKind::RegenerateIdentity,
            "Generate a NEW node identity? The NodeID changes and a registered validator stops validating under the old one. The old identity is kept in a snapshot.",
        )?;

        let pre = self
            .engine
            .backup(
                lock,
                BackupOptions {
                    include_data: false,
                    reason: SnapshotReason::PreRegenerate,
                },
            )
            .await?;
        info!("Pre-regenerate snapshot {}", pre.id);

        let binary = self.binary_for(state);
        match self.regenerate_steps(&binary).await {
            Ok(node_id) => {
                let mut report = OperationReport::succeeded(ActionKind::RegenerateIdentity)
                    .with_snapshot(&pre.path)
                    .note(format!("previous identity kept in snapshot {}", pre.id));
                report.node_id = node_id;
                Ok(report)
            }
            Err(e) => Err(self
                .roll_back(lock, ActionKind::RegenerateIdentity, e, &pre, None)
                .await),
        }
    }

    async fn regenerate_steps(&self, binary: &Path) -> Result<Option<String>, DriverError> {
        self.supervisor.stop().await?;
        for path in self.layout.identity_paths() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_at(&path)(e)),
            }
        }
        self.installer.generate_identity(binary, &self.layout).await?;
        self.secure_material()?;
        self.supervisor.start().await?;
        self.verify_service().await?;
        Ok(self.discover_node_id().await)
    }

    // === Read-only and maintenance ===

    pub async fn status(&self) -> Result<StatusReport, DriverError> {
        let state = self.observe().await?;
        let snapshots = self.engine.list_ids()?;

        let mut report = StatusReport {
            phase: state.phase,
            service: state.service,
            role: state.role(),
            network: state.network(),
            rpc_scope: state.rpc_scope(),
            binary_version: state.binary_version.clone(),
            node_version: None,
            node_id: None,
            healthy: None,
            bootstrapped: None,
            snapshot_count: snapshots.len(),
            latest_snapshot: snapshots.last().map(|id| id.to_string()),
            offered: offered_actions(state.phase),
        };

        if state.running() {
            report.node_version = self.probe.node_version().await.ok();
            if report.node_version.is_some() {
                report.node_id = self.probe.node_id().await.ok();
                report.healthy = self.probe.healthy().await.ok();
                report.bootstrapped = self.probe.is_bootstrapped("P").await.ok();
            }
        }
        Ok(report)
    }

    pub async fn logs(&self, lines: usize) -> Result<Vec<String>, DriverError> {
        Ok(self.supervisor.tail_logs(lines).await?)
    }

    /// Committed snapshots, newest first
    pub fn snapshots(&self) -> Result<Vec<Snapshot>, DriverError> {
        Ok(self.engine.list()?)
    }

    pub async fn verify_snapshot(
        &self,
        id: &SnapshotId,
    ) -> Result<(Snapshot, VerifyReport), DriverError> {
        let snapshot = self.engine.open(id)?;
        let report = self.engine.verify(&snapshot).await;
        Ok((snapshot, report))
    }

    /// Keep the newest `keep` snapshots.
    pub async fn prune(&self, keep: usize) -> Result<Vec<SnapshotId>, DriverError> {
        if keep == 0 {
            return Err(DriverError::Precondition(
                "refusing to prune every snapshot; keep at least one".to_string(),
            ));
        }
        let lock = OperationLock::acquire(&self.layout)?;
        Ok(self.engine.prune(&lock, keep, &[])?)
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

fn same_identity(a: &NodeIdentity, b: &NodeIdentity) -> bool {
    a.certificate == b.certificate
        && a.private_key.as_slice() == b.private_key.as_slice()
        && a.signer_key.as_slice() == b.signer_key.as_slice()
}

fn fatal_message(
    operation: ActionKind,
    failure: &DriverError,
    rollback_error: &BackupError,
    snapshot: &Path,
    log_tail: &[String],
) -> String {
    let mut message = format!(
        "{} failed: {}\nrollback failed: {}\nlast good snapshot: {}\nrestore it by hand: copy its identity/ and config/ into place, fix permissions, then start the service",
        operation,
        failure,
        rollback_error,
        snapshot.display()
    );
    if !log_tail.is_empty() {
        message.push_str("\nlast service log lines:");
        for line in log_tail {
            message.push_str("\n  ");
            message.push_str(line);
        }
    }
    message
}

/// Most recent `NodeID-...` token in service log lines
pub fn extract_node_id(lines: &[String]) -> Option<String> {
    lines.iter().rev().find_map(|line| {
        let start = line.rfind(NODE_ID_PREFIX)?;
        let id: String = line[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        (id.len() > NODE_ID_PREFIX.len()).then_some(id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::RpcRequest;
    use crate::error::FailureClass;
    use crate::installer::previous_path;
    use crate::probe::MockNodeProbe;
    use crate::prompt::{AssumeYes, FixedAnswers};
    use crate::testing::FakeInstaller;
    use avanode_store::{
        read_deployment_record, write_identity, Network, Role, RpcScope, DEFAULT_HTTP_PORT,
    };
    use avanode_supervisor::testing::MemorySupervisor;
    use avanode_supervisor::{is_managed, ServiceStatus, MANAGED_MARKER};
    use tempfile::TempDir;

    const NODE_ID: &str = "NodeID-7Xhw2mDxuDS44j42TCB6U5579esbSt3Lg";

    struct Rig {
        _tmp: TempDir,
        layout: NodeLayout,
        supervisor: Arc<MemorySupervisor>,
        installer: Arc<FakeInstaller>,
    }

    impl Rig {
        fn new(status: ServiceStatus) -> Self {
            Self::with_binary(status, None)
        }

        fn with_binary(status: ServiceStatus, installed: Option<&str>) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let layout = NodeLayout::new(
                tmp.path().join("avalanchego"),
                tmp.path().join("systemd").join("avalanchego.service"),
            );
            fs::create_dir_all(tmp.path().join("systemd")).unwrap();
            let installer = FakeInstaller::new(tmp.path().join("bin"));
            let installer = Arc::new(match installed {
                Some(version) => installer.with_installed(version),
                None => installer,
            });
            Rig {
                _tmp: tmp,
                layout,
                supervisor: Arc::new(MemorySupervisor::new(status)),
                installer,
            }
        }

        fn driver_with(&self, probe: MockNodeProbe, prompter: Arc<dyn Prompter>) -> Driver {
            let settings = DriverSettings {
                settle: Duration::ZERO,
                poll: Duration::from_millis(1),
                rpc_timeout: Duration::from_millis(20),
                ..DriverSettings::default()
            };
            Driver::new(
                self.layout.clone(),
                self.supervisor.clone(),
                self.installer.clone(),
                Arc::new(probe),
                prompter,
                settings,
            )
        }

        fn driver(&self) -> Driver {
            self.driver_with(healthy_probe(), Arc::new(AssumeYes))
        }

        /// Material of a node set up by hand: same layout, no managed marker
        fn hand_installed(&self) {
            self.layout.ensure_directory_layout(None).unwrap();
            write_identity(
                &self.layout,
                &NodeIdentity::new(b"old-cert".to_vec(), b"old-key".to_vec(), b"old-signer".to_vec()),
                None,
            )
            .unwrap();
            let config = NodeConfig::for_role(Role::Validator, Network::Testnet, &self.layout);
            fs::write(
                self.layout.config_path(),
                serde_json::to_string(&avanode_store::render_config(&config)).unwrap(),
            )
            .unwrap();
            fix_permissions(&self.layout, None).unwrap();

            let unit = UnitSpec {
                description: "avalanche".to_string(),
                user: "ubuntu".to_string(),
                group: "ubuntu".to_string(),
                working_dir: self.layout.root().to_path_buf(),
                exec: self.installer.default_binary(),
                args: launch_args(&self.layout),
                limit_nofile: 32768,
            }
            .render()
            .replace(MANAGED_MARKER, "# installed by hand");
            fs::write(self.layout.unit_path(), unit).unwrap();
        }
    }

    fn healthy_probe() -> MockNodeProbe {
        let mut probe = MockNodeProbe::new();
        probe
            .expect_node_version()
            .returning(|| Ok("avalanchego/1.11.3".to_string()));
        probe.expect_node_id().returning(|| Ok(NODE_ID.to_string()));
        probe.expect_healthy().returning(|| Ok(true));
        probe.expect_is_bootstrapped().returning(|_| Ok(true));
        probe
    }

    fn install_intent(version: &str) -> Intent {
        Intent::Install {
            role: Role::Validator,
            network: Network::Testnet,
            rpc: RpcRequest::loopback(),
            http_port: DEFAULT_HTTP_PORT,
            version: Some(version.to_string()),
        }
    }

    #[test]
    fn test_extract_node_id() {
        let lines = vec![
            "INFO node/node.go:1 initializing node {\"nodeID\": \"NodeID-AAA111\"}".to_string(),
            "INFO chains/manager.go:2 creating chain".to_string(),
            format!("INFO node/node.go:3 initializing node {{\"nodeID\": \"{}\"}}", NODE_ID),
        ];
        assert_eq!(extract_node_id(&lines), Some(NODE_ID.to_string()));
        assert_eq!(extract_node_id(&["NodeID-".to_string()]), None);
        assert_eq!(extract_node_id(&[]), None);
    }

    #[tokio::test]
    async fn test_fresh_install_produces_managed_running_node() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();

        let report = driver.execute(install_intent("1.11.2")).await.unwrap();
        assert_eq!(report.version.as_deref(), Some("v1.11.2"));
        assert_eq!(report.node_id.as_deref(), Some(NODE_ID));

        assert_eq!(identity_presence(&rig.layout), IdentityPresence::Complete);
        let unit = fs::read_to_string(rig.layout.unit_path()).unwrap();
        assert!(is_managed(&unit));
        assert_eq!(rig.supervisor.status(), ServiceStatus::Running);
        assert!(rig.supervisor.calls().contains(&"enable"));

        let record = read_deployment_record(&rig.layout).unwrap().unwrap();
        assert_eq!(record.role, Role::Validator);
        assert_eq!(record.network, Network::Testnet);
        assert_eq!(record.rpc_scope, RpcScope::Loopback);
        assert!(verify_permissions(&rig.layout, None).unwrap().is_empty());

        let state = driver.observe().await.unwrap();
        assert_eq!(state.phase, host::HostPhase::ManagedRunning);
    }

    #[tokio::test]
    async fn test_failed_install_leaves_host_uninstalled() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        rig.supervisor.crash_on_start(1);
        let driver = rig.driver();

        let err = driver.execute(install_intent("1.11.2")).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::ExternalCommand);

        assert!(!rig.layout.root().exists());
        assert!(!rig.layout.unit_path().exists());
        assert!(!rig.installer.default_binary().exists());
        assert_eq!(rig.installer.version(), None);
    }

    #[tokio::test]
    async fn test_failed_install_puts_existing_binary_back() {
        let rig = Rig::with_binary(ServiceStatus::NotInstalled, Some("1.11.0"));
        rig.supervisor.crash_on_start(1);
        let driver = rig.driver();

        driver.execute(install_intent("1.11.2")).await.unwrap_err();

        let binary = rig.installer.default_binary();
        assert_eq!(fs::read_to_string(&binary).unwrap(), "1.11.0");
        assert!(!previous_path(&binary).exists());
        assert_eq!(rig.installer.version().as_deref(), Some("v1.11.0"));
        assert!(!rig.layout.root().exists());
    }

    #[tokio::test]
    async fn test_cancel_on_empty_host_leaves_nothing_behind() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let report = rig.driver().execute(Intent::Cancel).await.unwrap();
        assert_eq!(report.operation, ActionKind::Cancel);
        assert!(!rig.layout.root().exists());
    }

    #[tokio::test]
    async fn test_public_rpc_request_for_validator_is_downgraded() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let intent = Intent::Install {
            role: Role::Validator,
            network: Network::Mainnet,
            rpc: RpcRequest {
                scope: RpcScope::Public,
                confirm_public: false,
            },
            http_port: DEFAULT_HTTP_PORT,
            version: None,
        };
        let report = rig.driver().execute(intent).await.unwrap();
        assert!(report.notes.iter().any(|n| n.contains("loopback")));
        let record = read_deployment_record(&rig.layout).unwrap().unwrap();
        assert_eq!(record.rpc_scope, RpcScope::Loopback);
    }

    #[tokio::test]
    async fn test_unmanaged_host_refuses_restore() {
        let rig = Rig::new(ServiceStatus::Running);
        rig.hand_installed();
        let unit_before = fs::read_to_string(rig.layout.unit_path()).unwrap();

        let intent = Intent::Restore {
            snapshot: "20260101T000000Z".parse().unwrap(),
            restore_data: false,
        };
        let err = rig.driver().execute(intent).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        match err {
            DriverError::Refused { offered, .. } => {
                assert!(offered.contains(&ActionKind::Migrate));
                assert!(!offered.contains(&ActionKind::Restore));
            }
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(rig.layout.unit_path()).unwrap(), unit_before);
        assert!(rig.supervisor.calls().iter().all(|c| *c == "status"));
    }

    #[tokio::test]
    async fn test_migrate_keeps_identity_and_takes_over() {
        let rig = Rig::with_binary(ServiceStatus::Running, Some("1.11.0"));
        rig.hand_installed();

        let intent = Intent::Migrate {
            role: Role::Validator,
            network: None,
            rpc: None,
            http_port: DEFAULT_HTTP_PORT,
        };
        let driver = rig.driver();
        let report = driver.execute(intent).await.unwrap();
        assert_eq!(report.snapshots.len(), 1);

        let identity = read_identity(&rig.layout).unwrap();
        assert_eq!(identity.certificate, b"old-cert".to_vec());
        assert_eq!(identity.private_key.as_slice(), b"old-key");
        assert_eq!(rig.installer.identities_generated(), 0);
        assert_eq!(rig.installer.version().as_deref(), Some("v1.11.0"));

        assert!(is_managed(&fs::read_to_string(rig.layout.unit_path()).unwrap()));
        let record = read_deployment_record(&rig.layout).unwrap().unwrap();
        assert_eq!(record.network, Network::Testnet);
        assert_eq!(driver.observe().await.unwrap().phase, host::HostPhase::ManagedRunning);

        let snapshots = driver.snapshots().unwrap();
        assert_eq!(snapshots[0].manifest.reason, SnapshotReason::PreMigrate);
    }

    #[tokio::test]
    async fn test_upgrade_replaces_binary_and_keeps_snapshot() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();

        let report = driver
            .execute(Intent::Upgrade {
                version: Some("1.11.3".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(report.version.as_deref(), Some("v1.11.3"));
        assert!(report.notes.iter().any(|n| n.contains("v1.11.2")));
        assert_eq!(report.snapshots.len(), 1);

        let record = read_deployment_record(&rig.layout).unwrap().unwrap();
        assert_eq!(record.binary_version.as_deref(), Some("v1.11.3"));
        let latest = driver.engine().latest().unwrap().unwrap();
        assert_eq!(latest.manifest.reason, SnapshotReason::PreUpgrade);
    }

    #[tokio::test]
    async fn test_failed_upgrade_rolls_back_binary_and_config() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();

        rig.supervisor.crash_on_start(1);
        let err = driver
            .execute(Intent::Upgrade {
                version: Some("1.11.3".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::RolledBack, "{}", err);
        assert_eq!(err.exit_code(), 5);

        assert_eq!(rig.installer.version().as_deref(), Some("v1.11.2"));
        let record = read_deployment_record(&rig.layout).unwrap().unwrap();
        assert_eq!(record.binary_version.as_deref(), Some("v1.11.2"));
        assert_eq!(rig.supervisor.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal_with_snapshot_path() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();

        rig.supervisor.crash_on_start(2);
        let err = driver
            .execute(Intent::Upgrade { version: None })
            .await
            .unwrap_err();
        assert_eq!(err.class(), FailureClass::Fatal);
        let pre = driver.engine().latest().unwrap().unwrap();
        assert!(err.to_string().contains(&pre.path.display().to_string()));
    }

    #[tokio::test]
    async fn test_declined_upgrade_changes_nothing() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        rig.driver().execute(install_intent("1.11.2")).await.unwrap();

        let prompter = Arc::new(FixedAnswers::new(&[false]));
        let driver = rig.driver_with(healthy_probe(), prompter.clone());
        let err = driver
            .execute(Intent::Upgrade { version: None })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Declined(_)));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(prompter.asked().len(), 1);
        assert!(driver.snapshots().unwrap().is_empty());
        assert_eq!(rig.installer.version().as_deref(), Some("v1.11.2"));
    }

    #[tokio::test]
    async fn test_silent_node_fails_verification() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let mut probe = MockNodeProbe::new();
        probe.expect_node_version().returning(|| {
            Err(crate::error::ProbeError::Malformed("connection refused".to_string()))
        });
        probe.expect_node_id().returning(|| {
            Err(crate::error::ProbeError::Malformed("connection refused".to_string()))
        });
        let driver = rig.driver_with(probe, Arc::new(AssumeYes));

        let err = driver.execute(install_intent("1.11.2")).await.unwrap_err();
        assert!(matches!(err, DriverError::Verification(_)), "{:?}", err);
        assert!(!rig.layout.root().exists());
    }

    #[tokio::test]
    async fn test_regenerate_identity_keeps_old_one_in_snapshot() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();
        let old_cert = read_identity(&rig.layout).unwrap().certificate;

        let report = driver.execute(Intent::RegenerateIdentity).await.unwrap();
        let new_cert = read_identity(&rig.layout).unwrap().certificate;
        assert_ne!(old_cert, new_cert);
        assert_eq!(rig.installer.identities_generated(), 2);

        let snapshot = &report.snapshots[0];
        let saved = fs::read(snapshot.join("identity").join(avanode_store::layout::CERT_FILE)).unwrap();
        assert_eq!(saved, old_cert);
    }

    #[tokio::test]
    async fn test_data_backup_pauses_running_service() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();
        fs::write(rig.layout.data_dir().join("db.bin"), vec![7u8; 4096]).unwrap();

        let report = driver
            .execute(Intent::Backup { include_data: true })
            .await
            .unwrap();
        let snapshot = driver.snapshots().unwrap().remove(0);
        assert!(snapshot.includes_data());
        assert_eq!(report.snapshots[0], snapshot.path);
        assert_eq!(rig.supervisor.status(), ServiceStatus::Running);

        let calls = rig.supervisor.calls();
        let stop = calls.iter().rposition(|c| *c == "stop").unwrap();
        let start = calls.iter().rposition(|c| *c == "start").unwrap();
        assert!(stop < start);
    }

    #[tokio::test]
    async fn test_restore_round_trip_through_driver() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        driver.execute(install_intent("1.11.2")).await.unwrap();
        let backup = driver
            .execute(Intent::Backup { include_data: false })
            .await
            .unwrap();
        let id: SnapshotId = backup.snapshots[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .parse()
            .unwrap();
        let original = read_identity(&rig.layout).unwrap().certificate;

        driver.execute(Intent::RegenerateIdentity).await.unwrap();
        assert_ne!(read_identity(&rig.layout).unwrap().certificate, original);

        let report = driver
            .execute(Intent::Restore {
                snapshot: id,
                restore_data: false,
            })
            .await
            .unwrap();
        assert_eq!(report.snapshots.len(), 2);
        assert_eq!(read_identity(&rig.layout).unwrap().certificate, original);
    }

    #[tokio::test]
    async fn test_status_and_prune() {
        let rig = Rig::new(ServiceStatus::NotInstalled);
        let driver = rig.driver();
        let status = driver.status().await.unwrap();
        assert_eq!(status.phase, host::HostPhase::Uninstalled);
        assert_eq!(status.node_version, None);

        driver.execute(install_intent("1.11.2")).await.unwrap();
        for _ in 0..3 {
            driver
                .execute(Intent::Backup { include_data: false })
                .await
                .unwrap();
        }
        let status = driver.status().await.unwrap();
        assert_eq!(status.snapshot_count, 3);
        assert_eq!(status.node_id.as_deref(), Some(NODE_ID));
        assert_eq!(status.healthy, Some(true));

        let removed = driver.prune(1).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(driver.snapshots().unwrap().len(), 1);
        assert!(driver.prune(0).await.is_err());
    }
}
