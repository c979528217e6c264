// BACKUP / RESTORE ENGINE
//
// Backup:  START -> STAGING -> VERIFYING -> COMMIT -> DONE
// Restore: START -> PRE-BACKUP -> SERVICE-STOP -> REPLACE -> PERMISSION-FIX
//          -> SERVICE-START -> VERIFY-RUNNING -> DONE
//
// SAFETY INVARIANTS:
// 1. Nothing partial is ever visible under backups/<id>; staging is renamed into place only after it verifies
// 2. Restore mutates nothing before its pre-restore snapshot is committed
// 3. Any failure after PRE-BACKUP runs the rollback sequence; the service is never left stopped silently
// 4. A failed rollback is reported as Fatal together with the last good snapshot and the log tail
// 5. Prune never removes the most recent `keep` snapshots nor the active restore target
// 6. A data directory is archived for a restore only while the service is stopped

use std::fmt;
use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use avanode_store::layout::{
    CERT_FILE, DEPLOYMENT_RECORD_FILE, KEY_FILE, NODE_CONFIG_FILE, SIGNER_KEY_FILE,
};
use avanode_store::{
    fix_permissions, identity_presence, verify_permissions, IdentityPresence, NodeLayout,
    OperationLock, Ownership, ViolationKind, CERT_FILE_MODE, CONFIG_FILE_MODE, SECRET_FILE_MODE,
};
use avanode_supervisor::{
    confirm_running, write_unit, ServiceStatus, ServiceSupervisor, DEFAULT_POLL_INTERVAL,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::archive::{create_archive, extract_archive, DATA_ARCHIVE, DEFAULT_ARCHIVE_TIMEOUT};
use crate::error::{at, BackupError};
use crate::snapshot::{
    ArchiveEntry, ManifestEntry, Snapshot, SnapshotId, SnapshotManifest, SnapshotReason,
    MANIFEST_FILE,
};
use crate::verify::{hash_file, verify_dir, verify_snapshot_dir, SnapshotViolation, VerifyReport};

/// How long a restarted node must stay up before a restore counts as done
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(10);

const SNAPSHOT_DIR_MODE: u32 = 0o700;
const MANIFEST_MODE: u32 = 0o600;
const STAGING_PREFIX: &str = ".staging-";
const RESTORE_TARGET_FILE: &str = ".restore-target";
const LOG_TAIL_LINES: usize = 50;

/// Restore phases after START, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreStep {
    PreBackup,
    ServiceStop,
    Replace,
    PermissionFix,
    ServiceStart,
    VerifyRunning,
}

impl RestoreStep {
    pub const ALL: [RestoreStep; 6] = [
        RestoreStep::PreBackup,
        RestoreStep::ServiceStop,
        RestoreStep::Replace,
        RestoreStep::PermissionFix,
        RestoreStep::ServiceStart,
        RestoreStep::VerifyRunning,
    ];

    fn name(&self) -> &'static str {
        match self {
            RestoreStep::PreBackup => "pre-backup",
            RestoreStep::ServiceStop => "service-stop",
            RestoreStep::Replace => "replace",
            RestoreStep::PermissionFix => "permission-fix",
            RestoreStep::ServiceStart => "service-start",
            RestoreStep::VerifyRunning => "verify-running",
        }
    }
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RestoreStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RestoreStep::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = RestoreStep::ALL.iter().map(|s| s.name()).collect();
                format!("unknown restore step `{}` (expected one of {})", s, names.join(", "))
            })
    }
}

/// Deliberate failure injection for rehearsing the rollback path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    pub fail_at: Option<RestoreStep>,
}

impl FaultPlan {
    pub fn none() -> Self {
        FaultPlan::default()
    }

    pub fn fail_at(step: RestoreStep) -> Self {
        FaultPlan {
            fail_at: Some(step),
        }
    }

    fn check(&self, step: RestoreStep) -> Result<(), BackupError> {
        if self.fail_at == Some(step) {
            warn!("Injecting fault at {}", step);
            return Err(BackupError::InjectedFault(step));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Archive the data directory alongside identity and config
    pub include_data: bool,

    pub reason: SnapshotReason,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            include_data: false,
            reason: SnapshotReason::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Also replace the data directory from the snapshot's archive
    pub restore_data: bool,
}

/// Everything an operator needs when automatic recovery gave up
#[derive(Debug, Clone)]
pub struct FatalReport {
    pub reason: String,
    pub failed_step: RestoreStep,
    pub rollback_error: String,

    /// Snapshot holding the state from before the restore
    pub last_good: PathBuf,

    /// Live files moved out of the way during REPLACE, if any remain
    pub aside: Option<PathBuf>,

    pub log_tail: Vec<String>,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "restore failed at {}: {}", self.failed_step, self.reason)?;
        writeln!(f, "rollback failed: {}", self.rollback_error)?;
        writeln!(f, "last good snapshot: {}", self.last_good.display())?;
        if let Some(aside) = &self.aside {
            writeln!(f, "previous live files: {}", aside.display())?;
        }
        if !self.log_tail.is_empty() {
            writeln!(f, "last service log lines:")?;
            for line in &self.log_tail {
                writeln!(f, "  {}", line)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum RestoreOutcome {
    Restored {
        snapshot: Snapshot,
        pre_restore: Snapshot,
    },
    RolledBack {
        reason: String,
        failed_step: RestoreStep,
        pre_restore: Snapshot,
    },
    Fatal(FatalReport),
}

/// One file the engine knows how to capture and put back
#[derive(Debug, Clone)]
struct Material {
    rel: String,
    source: PathBuf,
    mode: u32,
    secret: bool,
    required: bool,
}

/// Staging directory that removes itself unless committed.
struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self, BackupError> {
        private_dir(&path)?;
        Ok(StagingDir {
            path,
            committed: false,
        })
    }

    fn commit(mut self, dest: &Path) -> Result<(), BackupError> {
        fs::rename(&self.path, dest).map_err(at(dest))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        debug!("Discarding staging directory {}", self.path.display());
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug)]
struct Progress {
    step: RestoreStep,
    moved_aside: bool,
    unit_replaced: bool,

    /// Live directories that did not exist before REPLACE
    added: Vec<PathBuf>,
}

fn private_dir(path: &Path) -> Result<(), BackupError> {
    DirBuilder::new()
        .recursive(true)
        .mode(SNAPSHOT_DIR_MODE)
        .create(path)
        .map_err(at(path))?;
    fs::set_permissions(path, Permissions::from_mode(SNAPSHOT_DIR_MODE)).map_err(at(path))
}

fn write_manifest(dir: &Path, manifest: &SnapshotManifest) -> Result<(), BackupError> {
    let path = dir.join(MANIFEST_FILE);
    let mut bytes = serde_json::to_vec_pretty(manifest)?;
    bytes.push(b'\n');
    fs::write(&path, &bytes).map_err(at(&path))?;
    fs::set_permissions(&path, Permissions::from_mode(MANIFEST_MODE)).map_err(at(&path))
}

fn discard(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

/// Creates, verifies, prunes and restores snapshots of one node root.
///
/// Mutating operations take `&OperationLock` so they cannot run without the
/// node root being locked by the caller.
pub struct BackupEngine {
    layout: NodeLayout,
    supervisor: Arc<dyn ServiceSupervisor>,
    owner: Option<Ownership>,
    settle: Duration,
    poll: Duration,
    archive_timeout: Duration,
    faults: FaultPlan,
}

impl BackupEngine {
    pub fn new(layout: NodeLayout, supervisor: Arc<dyn ServiceSupervisor>) -> Self {
        BackupEngine {
            layout,
            supervisor,
            owner: None,
            settle: DEFAULT_SETTLE,
            poll: DEFAULT_POLL_INTERVAL,
            archive_timeout: DEFAULT_ARCHIVE_TIMEOUT,
            faults: FaultPlan::none(),
        }
    }

    /// Owner to restore files to (the service account)
    pub fn with_owner(mut self, owner: Option<Ownership>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_settle(mut self, settle: Duration, poll: Duration) -> Self {
        self.settle = settle;
        self.poll = poll;
        self
    }

    /// Bound on each tar run over the data directory
    pub fn with_archive_timeout(mut self, timeout: Duration) -> Self {
        self.archive_timeout = timeout;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn unit_rel(&self) -> Option<String> {
        self.layout
            .unit_path()
            .file_name()
            .map(|name| format!("service/{}", name.to_string_lossy()))
    }

    fn materials(&self) -> Vec<Material> {
        let mut materials = vec![
            Material {
                rel: format!("identity/{}", CERT_FILE),
                source: self.layout.cert_path(),
                mode: CERT_FILE_MODE,
                secret: false,
                required: true,
            },
            Material {
                rel: format!("identity/{}", KEY_FILE),
                source: self.layout.key_path(),
                mode: SECRET_FILE_MODE,
                secret: true,
                required: true,
            },
            Material {
                rel: format!("identity/{}", SIGNER_KEY_FILE),
                source: self.layout.signer_key_path(),
                mode: SECRET_FILE_MODE,
                secret: true,
                required: true,
            },
            Material {
                rel: format!("config/{}", NODE_CONFIG_FILE),
                source: self.layout.config_path(),
                mode: CONFIG_FILE_MODE,
                secret: false,
                required: true,
            },
            Material {
                rel: format!("config/{}", DEPLOYMENT_RECORD_FILE),
                source: self.layout.deployment_record_path(),
                mode: CONFIG_FILE_MODE,
                secret: false,
                required: false,
            },
            Material {
                rel: "config/chains/C/config.json".to_string(),
                source: self.layout.c_chain_config_path(),
                mode: CONFIG_FILE_MODE,
                secret: false,
                required: false,
            },
        ];
        if let Some(rel) = self.unit_rel() {
            materials.push(Material {
                rel,
                source: self.layout.unit_path().to_path_buf(),
                mode: CONFIG_FILE_MODE,
                secret: false,
                required: false,
            });
        }
        materials
    }

    fn destination(&self, rel: &str) -> Option<PathBuf> {
        self.materials()
            .into_iter()
            .find(|m| m.rel == rel)
            .map(|m| m.source)
    }

    // === Backup ===

    /// Snapshot identity and config (and optionally the data directory).
    ///
    /// Manual backups refuse to copy a layout with permission violations;
    /// automatic pre-operation backups warn and continue, since the
    /// operation that follows repairs permissions anyway.
    ///
    /// A pre-restore backup captures whatever material exists and records
    /// the rest as absent; every other backup needs the full identity and
    /// node config.
    pub async fn backup(
        &self,
        _lock: &OperationLock,
        options: BackupOptions,
    ) -> Result<Snapshot, BackupError> {
        let partial_ok = options.reason == SnapshotReason::PreRestore;
        let materials = self.materials();
        let mut absent = Vec::new();
        for missing in materials.iter().filter(|m| m.required && !m.source.is_file()) {
            if !partial_ok {
                return Err(BackupError::MissingMaterial(missing.source.clone()));
            }
            warn!(
                "{} is missing; recording it as absent in the pre-restore snapshot",
                missing.source.display()
            );
            absent.push(missing.rel.clone());
        }
        let data_dir = self.layout.data_dir();
        let include_data = if options.include_data && !data_dir.is_dir() {
            if !partial_ok {
                return Err(BackupError::MissingMaterial(data_dir));
            }
            warn!("{} is missing; no data archive taken", data_dir.display());
            false
        } else {
            options.include_data
        };

        let violations = verify_permissions(&self.layout, self.owner)?;
        if !violations.is_empty() {
            if options.reason == SnapshotReason::Manual {
                return Err(BackupError::UnsafeLayout(violations));
            }
            for violation in &violations {
                warn!("Continuing {} backup despite: {}", options.reason, violation);
            }
        }

        let backups = self.layout.backups_dir();
        private_dir(&backups)?;
        let id = SnapshotId::next(Utc::now(), &self.list_ids()?);

        // STAGING
        let staging = StagingDir::create(backups.join(format!("{}{}", STAGING_PREFIX, id)))?;
        info!("Staging snapshot {} ({})", id, options.reason);

        let mut files = Vec::new();
        for material in &materials {
            if !material.source.is_file() {
                debug!("Not present, skipping {}", material.source.display());
                continue;
            }
            let dest = staging.path.join(&material.rel);
            if let Some(parent) = dest.parent() {
                private_dir(parent)?;
            }
            fs::copy(&material.source, &dest).map_err(at(&dest))?;
            fs::set_permissions(&dest, Permissions::from_mode(material.mode)).map_err(at(&dest))?;
            let (size, sha256) = hash_file(&dest).map_err(at(&dest))?;
            files.push(ManifestEntry {
                path: material.rel.clone(),
                size,
                sha256,
                mode: material.mode,
                secret: material.secret,
            });
        }

        let data_archive = if include_data {
            let dest = staging.path.join(DATA_ARCHIVE);
            create_archive(&self.layout.data_dir(), &dest, self.archive_timeout).await?;
            let size = fs::metadata(&dest).map_err(at(&dest))?.len();
            Some(ArchiveEntry {
                path: DATA_ARCHIVE.to_string(),
                size,
            })
        } else {
            None
        };

        let manifest = SnapshotManifest {
            id,
            created_at: Utc::now(),
            reason: options.reason,
            file_count: files.len(),
            files,
            data_archive,
            absent,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        write_manifest(&staging.path, &manifest)?;

        // VERIFYING
        let report = verify_dir(&staging.path, &manifest, self.archive_timeout).await;
        for warning in &report.warnings {
            warn!("Snapshot {}: {}", id, warning);
        }
        if !report.is_clean() {
            return Err(BackupError::Corrupt {
                id: id.to_string(),
                violations: report.violations,
            });
        }

        // COMMIT
        let final_path = backups.join(id.to_string());
        staging.commit(&final_path)?;
        info!("Snapshot {} committed at {}", id, final_path.display());

        Ok(Snapshot {
            id,
            path: final_path,
            manifest,
        })
    }

    // === Inspection ===

    /// Committed snapshot ids, oldest first
    pub fn list_ids(&self) -> Result<Vec<SnapshotId>, BackupError> {
        let dir = self.layout.backups_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(at(&dir)(e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(at(&dir))?;
            if !entry.file_type().map_err(at(&dir))?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_string_lossy().parse::<SnapshotId>() {
                Ok(id) => ids.push(id),
                Err(_) => debug!("Ignoring {:?} in {}", name, dir.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Readable snapshots, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>, BackupError> {
        let mut snapshots = Vec::new();
        for id in self.list_ids()?.into_iter().rev() {
            match self.open(&id) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping snapshot {}: {}", id, e),
            }
        }
        Ok(snapshots)
    }

    pub fn open(&self, id: &SnapshotId) -> Result<Snapshot, BackupError> {
        let dir = self.layout.backups_dir().join(id.to_string());
        if !dir.is_dir() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        Snapshot::open(&dir)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, BackupError> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn latest_with_reason(
        &self,
        reason: SnapshotReason,
    ) -> Result<Option<Snapshot>, BackupError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|s| s.manifest.reason == reason))
    }

    /// Re-check a committed snapshot against the manifest on disk.
    pub async fn verify(&self, snapshot: &Snapshot) -> VerifyReport {
        verify_snapshot_dir(&snapshot.path, self.archive_timeout).await
    }

    // === Retention ===

    /// Delete snapshots beyond the newest `keep`.
    ///
    /// Ids in `protect` and the active restore target survive even when they
    /// fall outside the window. Returns the removed ids.
    pub fn prune(
        &self,
        _lock: &OperationLock,
        keep: usize,
        protect: &[SnapshotId],
    ) -> Result<Vec<SnapshotId>, BackupError> {
        let ids = self.list_ids()?;
        let mut protected = protect.to_vec();
        if let Some(active) = self.restore_target()? {
            protected.push(active);
        }

        let excess = ids.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for id in ids.into_iter().take(excess) {
            if protected.contains(&id) {
                info!("Keeping snapshot {}: in use by a restore", id);
                continue;
            }
            let dir = self.layout.backups_dir().join(id.to_string());
            fs::remove_dir_all(&dir).map_err(at(&dir))?;
            info!("Pruned snapshot {}", id);
            removed.push(id);
        }
        Ok(removed)
    }

    /// Snapshot an in-progress (or fatally interrupted) restore is using
    pub fn restore_target(&self) -> Result<Option<SnapshotId>, BackupError> {
        let path = self.layout.backups_dir().join(RESTORE_TARGET_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => match text.trim().parse::<SnapshotId>() {
                Ok(id) => Ok(Some(id)),
                Err(_) => {
                    warn!("Ignoring unreadable restore marker {}", path.display());
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(at(&path)(e)),
        }
    }

    fn set_restore_target(&self, id: &SnapshotId) -> Result<(), BackupError> {
        let path = self.layout.backups_dir().join(RESTORE_TARGET_FILE);
        fs::write(&path, format!("{}\n", id)).map_err(at(&path))
    }

    fn clear_restore_target(&self) {
        let path = self.layout.backups_dir().join(RESTORE_TARGET_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    // === Restore ===

    /// Replace live identity and config with those of snapshot `id`.
    ///
    /// Problems found before anything is touched (unknown or corrupt
    /// snapshot, failed pre-restore backup) are returned as errors. Once the
    /// pre-restore snapshot exists every failure is answered with a rollback,
    /// and the result is one of the three outcomes.
    pub async fn restore(
        &self,
        lock: &OperationLock,
        id: &SnapshotId,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome, BackupError> {
        let target = self.open(id)?;
        let report = self.verify(&target).await;
        for warning in &report.warnings {
            warn!("Snapshot {}: {}", id, warning);
        }
        if !report.is_clean() {
            return Err(BackupError::Corrupt {
                id: id.to_string(),
                violations: report.violations,
            });
        }
        if !target.manifest.absent.is_empty() {
            return Err(BackupError::Corrupt {
                id: id.to_string(),
                violations: target
                    .manifest
                    .absent
                    .iter()
                    .map(|path| SnapshotViolation::MissingEntry(path.clone()))
                    .collect(),
            });
        }
        if options.restore_data && !target.includes_data() {
            return Err(BackupError::NoDataArchive(id.to_string()));
        }

        // PRE-BACKUP
        self.faults.check(RestoreStep::PreBackup)?;
        // the data directory is only archived with the node stopped
        let paused = options.restore_data
            && self.supervisor.is_running().await? == ServiceStatus::Running;
        if paused {
            info!(
                "Stopping {} before archiving the data directory",
                self.supervisor.unit_name()
            );
            self.supervisor.stop().await?;
        }
        let pre_restore = match self
            .backup(
                lock,
                BackupOptions {
                    include_data: options.restore_data,
                    reason: SnapshotReason::PreRestore,
                },
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if paused {
                    self.resume_after_pause().await;
                }
                return Err(e);
            }
        };
        info!(
            "Pre-restore snapshot {} at {}",
            pre_restore.id,
            pre_restore.path.display()
        );

        self.set_restore_target(&target.id)?;
        let aside = self
            .layout
            .root()
            .join(format!(".restore-aside-{}", pre_restore.id));
        let mut progress = Progress {
            step: RestoreStep::ServiceStop,
            moved_aside: false,
            unit_replaced: false,
            added: Vec::new(),
        };

        let failure = match self.apply(&target, &aside, options, &mut progress).await {
            Ok(()) => {
                discard(&aside);
                self.clear_restore_target();
                info!("Restored snapshot {}", target.id);
                return Ok(RestoreOutcome::Restored {
                    snapshot: target,
                    pre_restore,
                });
            }
            Err(e) => e,
        };

        error!("Restore failed at {}: {}", progress.step, failure);
        match self.revert(&pre_restore, &aside, &progress).await {
            Ok(()) => {
                self.clear_restore_target();
                warn!(
                    "Restore of {} rolled back to pre-restore snapshot {}",
                    target.id, pre_restore.id
                );
                Ok(RestoreOutcome::RolledBack {
                    reason: failure.to_string(),
                    failed_step: progress.step,
                    pre_restore,
                })
            }
            Err(rollback_error) => {
                error!("Rollback failed: {}", rollback_error);
                let log_tail = match self.supervisor.tail_logs(LOG_TAIL_LINES).await {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!("Could not read service logs: {}", e);
                        Vec::new()
                    }
                };
                Ok(RestoreOutcome::Fatal(FatalReport {
                    reason: failure.to_string(),
                    failed_step: progress.step,
                    rollback_error: rollback_error.to_string(),
                    last_good: pre_restore.path,
                    aside: aside.exists().then_some(aside),
                    log_tail,
                }))
            }
        }
    }

    async fn apply(
        &self,
        target: &Snapshot,
        aside: &Path,
        options: RestoreOptions,
        progress: &mut Progress,
    ) -> Result<(), BackupError> {
        progress.step = RestoreStep::ServiceStop;
        self.faults.check(RestoreStep::ServiceStop)?;
        info!("Stopping {}", self.supervisor.unit_name());
        self.supervisor.stop().await?;

        progress.step = RestoreStep::Replace;
        progress.added = self
            .swappable(options.restore_data)
            .into_iter()
            .filter(|(_, live)| !live.exists())
            .map(|(_, live)| live)
            .collect();
        progress.moved_aside = true;
        self.move_aside(aside, options.restore_data)?;
        self.faults.check(RestoreStep::Replace)?;
        progress.unit_replaced = self.carries_unit(target);
        self.place(target, options.restore_data).await?;

        progress.step = RestoreStep::PermissionFix;
        self.faults.check(RestoreStep::PermissionFix)?;
        self.fix_and_audit()?;

        progress.step = RestoreStep::ServiceStart;
        self.faults.check(RestoreStep::ServiceStart)?;
        info!("Starting {}", self.supervisor.unit_name());
        self.supervisor.start().await?;

        progress.step = RestoreStep::VerifyRunning;
        self.faults.check(RestoreStep::VerifyRunning)?;
        self.verify_running().await
    }

    async fn revert(
        &self,
        pre_restore: &Snapshot,
        aside: &Path,
        progress: &Progress,
    ) -> Result<(), BackupError> {
        warn!("Rolling back to pre-restore snapshot {}", pre_restore.id);
        self.supervisor.stop().await?;

        if progress.moved_aside {
            self.move_back(aside)?;
            discard(aside);
            for added in &progress.added {
                if added.exists() {
                    fs::remove_dir_all(added).map_err(at(added))?;
                    debug!("Removed {} added by the restore", added.display());
                }
            }
            if identity_presence(&self.layout) != IdentityPresence::Complete
                && pre_restore.manifest.absent.is_empty()
            {
                warn!("Identity incomplete after moving files back, copying from snapshot");
                self.place(pre_restore, false).await?;
            }
        }
        if progress.unit_replaced {
            self.put_unit_back(pre_restore).await?;
        }

        let absent: Vec<PathBuf> = pre_restore
            .manifest
            .absent
            .iter()
            .filter_map(|rel| self.destination(rel))
            .collect();
        self.fix_and_audit_except(&absent)?;
        self.supervisor.start().await?;
        self.verify_running().await
    }

    /// Return the node to `snapshot` after a failed operation.
    ///
    /// Stops the service, swaps identity and config for the snapshot's copies,
    /// repairs permissions, starts and confirms the service. No further
    /// recovery is attempted if any of that fails.
    pub async fn rollback(&self, _lock: &OperationLock, snapshot: &Snapshot) -> Result<(), BackupError> {
        let report = self.verify(snapshot).await;
        if !report.is_clean() {
            return Err(BackupError::Corrupt {
                id: snapshot.id.to_string(),
                violations: report.violations,
            });
        }

        warn!("Rolling back to snapshot {}", snapshot.id);
        self.supervisor.stop().await?;

        let aside = self.layout.root().join(format!(
            ".rollback-aside-{}-{}",
            snapshot.id,
            Utc::now().timestamp()
        ));
        self.move_aside(&aside, false)?;
        self.place(snapshot, false).await?;
        self.fix_and_audit()?;
        self.supervisor.start().await?;
        self.verify_running().await?;

        discard(&aside);
        info!("Rolled back to snapshot {}", snapshot.id);
        Ok(())
    }

    // === Restore helpers ===

    fn swappable(&self, include_data: bool) -> Vec<(&'static str, PathBuf)> {
        let mut dirs = vec![
            ("identity", self.layout.identity_dir()),
            ("config", self.layout.config_dir()),
        ];
        if include_data {
            dirs.push(("data", self.layout.data_dir()));
        }
        dirs
    }

    fn move_aside(&self, aside: &Path, include_data: bool) -> Result<(), BackupError> {
        private_dir(aside)?;
        for (name, live) in self.swappable(include_data) {
            if !live.exists() {
                continue;
            }
            let dest = aside.join(name);
            fs::rename(&live, &dest).map_err(at(&live))?;
            debug!("Moved {} to {}", live.display(), dest.display());
        }
        Ok(())
    }

    /// Restart the service after a pause that ended in an error.
    async fn resume_after_pause(&self) {
        info!("Starting {} again", self.supervisor.unit_name());
        if let Err(e) = self.supervisor.start().await {
            error!(
                "Could not start {} after the failed pre-restore backup: {}",
                self.supervisor.unit_name(),
                e
            );
        }
    }

    fn move_back(&self, aside: &Path) -> Result<(), BackupError> {
        for (name, live) in self.swappable(true) {
            let saved = aside.join(name);
            if !saved.exists() {
                continue;
            }
            if live.exists() {
                fs::remove_dir_all(&live).map_err(at(&live))?;
            }
            fs::rename(&saved, &live).map_err(at(&saved))?;
            debug!("Moved {} back to {}", saved.display(), live.display());
        }
        Ok(())
    }

    fn carries_unit(&self, snapshot: &Snapshot) -> bool {
        self.unit_rel()
            .map(|rel| snapshot.manifest.entry(&rel).is_some())
            .unwrap_or(false)
    }

    /// Copy a snapshot's files to their live locations.
    async fn place(&self, snapshot: &Snapshot, restore_data: bool) -> Result<(), BackupError> {
        self.layout.ensure_directory_layout(self.owner)?;
        let unit_rel = self.unit_rel();

        for entry in &snapshot.manifest.files {
            let src = snapshot.path.join(&entry.path);
            if unit_rel.as_deref() == Some(entry.path.as_str()) {
                self.install_unit(&src).await?;
                continue;
            }
            let Some(dest) = self.destination(&entry.path) else {
                warn!("Skipping unrecognised snapshot entry {}", entry.path);
                continue;
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(at(parent))?;
            }
            fs::copy(&src, &dest).map_err(at(&dest))?;
            fs::set_permissions(&dest, Permissions::from_mode(entry.mode)).map_err(at(&dest))?;
            debug!("Placed {}", dest.display());
        }

        if restore_data {
            if let Some(archive) = &snapshot.manifest.data_archive {
                extract_archive(
                    &snapshot.path.join(&archive.path),
                    &self.layout.data_dir(),
                    self.archive_timeout,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn install_unit(&self, src: &Path) -> Result<(), BackupError> {
        let text = fs::read_to_string(src).map_err(at(src))?;
        let unit_path = self.layout.unit_path();
        write_unit(unit_path, &text).map_err(at(unit_path))?;
        self.supervisor.reload_definitions().await?;
        Ok(())
    }

    async fn put_unit_back(&self, pre_restore: &Snapshot) -> Result<(), BackupError> {
        match self.unit_rel() {
            Some(rel) if pre_restore.manifest.entry(&rel).is_some() => {
                self.install_unit(&pre_restore.path.join(rel)).await
            }
            _ => {
                // there was no unit before the restore
                let unit_path = self.layout.unit_path();
                match fs::remove_file(unit_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(at(unit_path)(e)),
                }
                self.supervisor.reload_definitions().await?;
                Ok(())
            }
        }
    }

    fn fix_and_audit(&self) -> Result<(), BackupError> {
        self.fix_and_audit_except(&[])
    }

    /// As `fix_and_audit`, but `absent` files may stay missing.
    fn fix_and_audit_except(&self, absent: &[PathBuf]) -> Result<(), BackupError> {
        self.layout.ensure_directory_layout(self.owner)?;
        fix_permissions(&self.layout, self.owner)?;
        let violations: Vec<_> = verify_permissions(&self.layout, self.owner)?
            .into_iter()
            .filter(|v| !(v.kind == ViolationKind::Missing && absent.contains(&v.path)))
            .collect();
        if !violations.is_empty() {
            return Err(BackupError::UnsafeLayout(violations));
        }
        Ok(())
    }

    async fn verify_running(&self) -> Result<(), BackupError> {
        if confirm_running(self.supervisor.as_ref(), self.settle, self.poll).await? {
            Ok(())
        } else {
            Err(BackupError::NotRunning(self.settle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avanode_store::{
        write_config, write_identity, DeploymentRecord, Network, NodeConfig, NodeIdentity, Role,
    };
    use avanode_supervisor::testing::MemorySupervisor;

    const UNIT_TEXT: &str = "# Managed-By: avanode\n[Unit]\nDescription=AvalancheGo\n";

    struct Fixture {
        _tmp: tempfile::TempDir,
        layout: NodeLayout,
        supervisor: Arc<MemorySupervisor>,
        engine: BackupEngine,
        lock: OperationLock,
    }

    impl Fixture {
        fn engine_with(&self, faults: FaultPlan) -> BackupEngine {
            BackupEngine::new(self.layout.clone(), self.supervisor.clone())
                .with_settle(Duration::ZERO, Duration::from_millis(1))
                .with_faults(faults)
        }

        fn snapshot_dirs(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.layout.backups_dir())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().unwrap().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    fn identity(key: &[u8]) -> NodeIdentity {
        NodeIdentity::new(
            b"-----BEGIN CERTIFICATE-----\ncert\n".to_vec(),
            key.to_vec(),
            vec![9u8; 32],
        )
    }

    fn fixture_with(supervisor: MemorySupervisor) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("avalanchego.service"));
        layout.ensure_directory_layout(None).unwrap();
        write_identity(&layout, &identity(b"key-one"), None).unwrap();
        let config = NodeConfig::for_role(Role::Validator, Network::Testnet, &layout);
        write_config(&layout, &config, &DeploymentRecord::for_config(&config, None), None).unwrap();
        fs::write(layout.unit_path(), UNIT_TEXT).unwrap();

        let supervisor = Arc::new(supervisor);
        let engine = BackupEngine::new(layout.clone(), supervisor.clone())
            .with_settle(Duration::ZERO, Duration::from_millis(1));
        let lock = OperationLock::acquire(&layout).unwrap();
        Fixture {
            _tmp: tmp,
            layout,
            supervisor,
            engine,
            lock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemorySupervisor::running())
    }

    fn live_key(layout: &NodeLayout) -> Vec<u8> {
        fs::read(layout.key_path()).unwrap()
    }

    #[tokio::test]
    async fn test_backup_produces_verified_snapshot() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();

        assert_eq!(snapshot.manifest.file_count, 7);
        assert!(snapshot.manifest.entry("service/avalanchego.service").is_some());
        assert!(snapshot.manifest.entry("identity/staker.key").unwrap().secret);
        assert!(fx.engine.verify(&snapshot).await.is_clean());

        // only the committed directory remains, no staging leftovers
        assert_eq!(fx.snapshot_dirs(), vec![snapshot.id.to_string()]);
        let key_mode = fs::metadata(snapshot.path.join("identity/staker.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(key_mode, SECRET_FILE_MODE);
    }

    #[tokio::test]
    async fn test_manual_backup_refuses_unsafe_layout() {
        let fx = fixture();
        fs::set_permissions(fx.layout.key_path(), Permissions::from_mode(0o644)).unwrap();

        let err = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::UnsafeLayout(_)));
        assert!(fx.snapshot_dirs().is_empty());

        // automatic backups warn and still produce a clean snapshot
        let options = BackupOptions {
            include_data: false,
            reason: SnapshotReason::PreUpgrade,
        };
        let snapshot = fx.engine.backup(&fx.lock, options).await.unwrap();
        assert!(fx.engine.verify(&snapshot).await.is_clean());
    }

    #[tokio::test]
    async fn test_backup_requires_identity() {
        let fx = fixture();
        fs::remove_file(fx.layout.signer_key_path()).unwrap();
        let err = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingMaterial(p) if p == fx.layout.signer_key_path()));
    }

    #[tokio::test]
    async fn test_restore_round_trip_is_byte_identical() {
        let fx = fixture();
        let key_before = live_key(&fx.layout);
        let config_before = fs::read(fx.layout.config_path()).unwrap();

        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RestoreOutcome::Restored { .. }));
        assert_eq!(live_key(&fx.layout), key_before);
        assert_eq!(fs::read(fx.layout.config_path()).unwrap(), config_before);
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
        assert_eq!(fx.engine.restore_target().unwrap(), None);
        assert!(verify_permissions(&fx.layout, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_older_snapshot_replaces_identity() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        write_identity(&fx.layout, &identity(b"key-two"), None).unwrap();

        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        match outcome {
            RestoreOutcome::Restored { pre_restore, .. } => {
                assert_eq!(pre_restore.manifest.reason, SnapshotReason::PreRestore);
                assert_eq!(
                    fs::read(pre_restore.path.join("identity/staker.key")).unwrap(),
                    b"key-two"
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(live_key(&fx.layout), b"key-one");
        assert_eq!(fx.engine.list_ids().unwrap().len(), 2);

        let leftovers: Vec<_> = fs::read_dir(fx.layout.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".restore-aside"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_injected_replace_fault_rolls_back() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        write_identity(&fx.layout, &identity(b"key-two"), None).unwrap();
        let config_before = fs::read(fx.layout.config_path()).unwrap();

        let engine = fx.engine_with(FaultPlan::fail_at(RestoreStep::Replace));
        let outcome = engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();

        match outcome {
            RestoreOutcome::RolledBack { failed_step, .. } => {
                assert_eq!(failed_step, RestoreStep::Replace)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(live_key(&fx.layout), b"key-two");
        assert_eq!(fs::read(fx.layout.config_path()).unwrap(), config_before);
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
        assert_eq!(engine.restore_target().unwrap(), None);
    }

    #[tokio::test]
    async fn test_every_step_fault_leaves_prior_state_running() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        write_identity(&fx.layout, &identity(b"key-two"), None).unwrap();

        for step in RestoreStep::ALL.into_iter().skip(1) {
            let engine = fx.engine_with(FaultPlan::fail_at(step));
            let outcome = engine
                .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
                .await
                .unwrap();
            assert!(
                matches!(&outcome, RestoreOutcome::RolledBack { failed_step, .. } if *failed_step == step),
                "{step}: {outcome:?}"
            );
            assert_eq!(live_key(&fx.layout), b"key-two", "{step}");
            assert_eq!(fx.supervisor.status(), ServiceStatus::Running, "{step}");
        }
    }

    #[tokio::test]
    async fn test_pre_backup_fault_mutates_nothing() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        let engine = fx.engine_with(FaultPlan::fail_at(RestoreStep::PreBackup));

        let err = engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::InjectedFault(RestoreStep::PreBackup)));
        assert!(!fx.supervisor.calls().contains(&"stop"));
    }

    #[tokio::test]
    async fn test_crash_after_start_rolls_back() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        write_identity(&fx.layout, &identity(b"key-two"), None).unwrap();
        fx.supervisor.crash_on_start(1);

        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RestoreOutcome::RolledBack {
                failed_step: RestoreStep::VerifyRunning,
                ..
            }
        ));
        assert_eq!(live_key(&fx.layout), b"key-two");
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal() {
        let fx = fixture_with(MemorySupervisor::running().with_logs(&["panic: bad signer key"]));
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        fx.supervisor.crash_on_start(2);

        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        let report = match outcome {
            RestoreOutcome::Fatal(report) => report,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(report.failed_step, RestoreStep::VerifyRunning);
        assert!(report.last_good.join(MANIFEST_FILE).is_file());
        assert_eq!(report.log_tail, vec!["panic: bad signer key"]);
        assert!(report.to_string().contains("last good snapshot"));

        // the marker keeps the target safe from pruning
        assert_eq!(fx.engine.restore_target().unwrap(), Some(snapshot.id));
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let fx = fixture();
        for _ in 0..5 {
            fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        }
        let ids = fx.engine.list_ids().unwrap();
        assert_eq!(ids.len(), 5);

        let removed = fx.engine.prune(&fx.lock, 3, &[]).unwrap();
        assert_eq!(removed, ids[..2].to_vec());
        assert_eq!(fx.engine.list_ids().unwrap(), ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_prune_spares_restore_target() {
        let fx = fixture();
        for _ in 0..5 {
            fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        }
        let ids = fx.engine.list_ids().unwrap();
        fx.engine.set_restore_target(&ids[0]).unwrap();

        let removed = fx.engine.prune(&fx.lock, 3, &[]).unwrap();
        assert_eq!(removed, vec![ids[1]]);
        let remaining = fx.engine.list_ids().unwrap();
        assert!(remaining.contains(&ids[0]));
        assert_eq!(&remaining[1..], &ids[2..]);

        let removed = fx.engine.prune(&fx.lock, 1, &[ids[4], ids[3]]).unwrap();
        assert_eq!(removed, vec![ids[2]]);
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let fx = fixture();
        let first = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        let second = fx
            .engine
            .backup(
                &fx.lock,
                BackupOptions {
                    include_data: false,
                    reason: SnapshotReason::PreUpgrade,
                },
            )
            .await
            .unwrap();

        let listed: Vec<SnapshotId> = fx.engine.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);
        assert_eq!(fx.engine.latest().unwrap().unwrap().id, second.id);
        assert_eq!(
            fx.engine
                .latest_with_reason(SnapshotReason::Manual)
                .unwrap()
                .unwrap()
                .id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();

        fs::write(snapshot.path.join("config/node.json"), b"{\"tampered\":true}").unwrap();
        fs::set_permissions(snapshot.path.join("identity/signer.key"), Permissions::from_mode(0o644))
            .unwrap();
        fs::write(snapshot.path.join("identity/extra.pem"), b"x").unwrap();

        let report = fx.engine.verify(&snapshot).await;
        assert!(!report.is_clean());
        let rendered: Vec<String> = report.violations.iter().map(|v| v.to_string()).collect();
        assert!(rendered.iter().any(|v| v.contains("config/node.json")), "{rendered:?}");
        assert!(rendered.iter().any(|v| v.contains("secret file has mode 644")), "{rendered:?}");
        assert!(rendered.iter().any(|v| v.contains("file count")), "{rendered:?}");

        let err = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Corrupt { .. }));
        assert!(!fx.supervisor.calls().contains(&"stop"));
    }

    #[tokio::test]
    async fn test_data_archive_backup_and_restore() {
        let fx = fixture();
        fs::create_dir_all(fx.layout.data_dir().join("db")).unwrap();
        fs::write(fx.layout.data_dir().join("db/blocks"), b"v1").unwrap();

        let options = BackupOptions {
            include_data: true,
            reason: SnapshotReason::Manual,
        };
        let snapshot = fx.engine.backup(&fx.lock, options).await.unwrap();
        assert!(snapshot.includes_data());
        let report = fx.engine.verify(&snapshot).await;
        assert!(report.is_clean(), "{:?}", report.violations);
        // a tiny archive is suspicious but legitimate
        assert_eq!(report.warnings.len(), 1);

        fs::write(fx.layout.data_dir().join("db/blocks"), b"v2").unwrap();
        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions { restore_data: true })
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored { .. }));
        assert_eq!(fs::read(fx.layout.data_dir().join("db/blocks")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_restore_data_stops_service_before_archiving() {
        let fx = fixture();
        fs::create_dir_all(fx.layout.data_dir().join("db")).unwrap();
        fs::write(fx.layout.data_dir().join("db/blocks"), b"v1").unwrap();
        let options = BackupOptions {
            include_data: true,
            reason: SnapshotReason::Manual,
        };
        let snapshot = fx.engine.backup(&fx.lock, options).await.unwrap();
        assert!(fx.supervisor.calls().is_empty());

        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions { restore_data: true })
            .await
            .unwrap();
        let RestoreOutcome::Restored { pre_restore, .. } = outcome else {
            panic!("expected restored, got {:?}", outcome);
        };
        assert!(pre_restore.includes_data());
        // the pre-restore backup makes no supervisor calls, so the stop precedes its archive
        assert_eq!(fx.supervisor.calls()[..2], ["status", "stop"]);
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_restore_without_data_skips_the_pause() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        let engine = fx.engine_with(FaultPlan::fail_at(RestoreStep::ServiceStop));

        let outcome = engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::RolledBack { .. }));
        assert_eq!(fx.supervisor.calls().first(), Some(&"stop"));
    }

    #[tokio::test]
    async fn test_restore_recovers_lost_staking_key() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        fs::remove_file(fx.layout.key_path()).unwrap();

        let outcome = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        let RestoreOutcome::Restored { pre_restore, .. } = outcome else {
            panic!("expected restored, got {:?}", outcome);
        };
        assert_eq!(live_key(&fx.layout), b"key-one");
        assert_eq!(pre_restore.manifest.absent, vec!["identity/staker.key".to_string()]);

        let report = fx.engine.verify(&pre_restore).await;
        assert!(report.is_clean(), "{:?}", report.violations);
        assert_eq!(report.warnings.len(), 1);

        // an incomplete snapshot is never a restore target
        let err = fx
            .engine
            .restore(&fx.lock, &pre_restore.id, RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_rollback_after_lost_key_removes_restored_key() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        fs::remove_file(fx.layout.key_path()).unwrap();
        let engine = fx.engine_with(FaultPlan::fail_at(RestoreStep::ServiceStart));

        let outcome = engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions::default())
            .await
            .unwrap();
        assert!(
            matches!(outcome, RestoreOutcome::RolledBack { .. }),
            "{:?}",
            outcome
        );
        assert!(!fx.layout.key_path().exists());
        assert!(fx.layout.cert_path().is_file());
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_restore_data_requires_archive() {
        let fx = fixture();
        let snapshot = fx.engine.backup(&fx.lock, BackupOptions::default()).await.unwrap();
        let err = fx
            .engine
            .restore(&fx.lock, &snapshot.id, RestoreOptions { restore_data: true })
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NoDataArchive(_)));
    }

    #[tokio::test]
    async fn test_rollback_returns_to_snapshot() {
        let fx = fixture();
        let options = BackupOptions {
            include_data: false,
            reason: SnapshotReason::PreUpgrade,
        };
        let snapshot = fx.engine.backup(&fx.lock, options).await.unwrap();
        write_identity(&fx.layout, &identity(b"key-two"), None).unwrap();
        fs::write(fx.layout.unit_path(), "[Unit]\n").unwrap();

        fx.engine.rollback(&fx.lock, &snapshot).await.unwrap();
        assert_eq!(live_key(&fx.layout), b"key-one");
        assert_eq!(fs::read_to_string(fx.layout.unit_path()).unwrap(), UNIT_TEXT);
        assert!(fx.supervisor.calls().contains(&"daemon-reload"));
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
    }

    #[test]
    fn test_restore_step_names_parse() {
        for step in RestoreStep::ALL {
            assert_eq!(step.to_string().parse::<RestoreStep>().unwrap(), step);
        }
        assert!("sideways".parse::<RestoreStep>().is_err());
    }
}
