// NODE DIRECTORY LAYOUT
//
// <root>/identity/        staker.crt, staker.key, signer.key     (0700)
// <root>/config/          node.json, avanode.json, chains/C/     (0750)
// <root>/data/            node database                          (0700)
// <root>/logs/            node log files                         (0750)
// <root>/backups/<id>/    snapshots                              (0700)
// <root>/.avanode.lock    operation lock
//
// SAFETY INVARIANTS:
// 1. ensure_directory_layout is idempotent
// 2. Existing directories with wrong mode or owner are corrected, never recreated

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{getegid, geteuid, User};
use tracing::{debug, info};

use crate::error::{at, StoreError};

pub const IDENTITY_DIR_MODE: u32 = 0o700;
pub const CONFIG_DIR_MODE: u32 = 0o750;
pub const DATA_DIR_MODE: u32 = 0o700;
pub const LOG_DIR_MODE: u32 = 0o750;
pub const BACKUP_DIR_MODE: u32 = 0o700;
const ROOT_DIR_MODE: u32 = 0o755;

pub const CERT_FILE: &str = "staker.crt";
pub const KEY_FILE: &str = "staker.key";
pub const SIGNER_KEY_FILE: &str = "signer.key";
pub const NODE_CONFIG_FILE: &str = "node.json";
pub const DEPLOYMENT_RECORD_FILE: &str = "avanode.json";

/// Owner applied to everything under the root (the service account)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Effective user and group of this process
    pub fn current() -> Self {
        Ownership {
            uid: geteuid().as_raw(),
            gid: getegid().as_raw(),
        }
    }

    pub fn for_user(name: &str) -> Result<Self, StoreError> {
        match User::from_name(name)? {
            Some(user) => Ok(Ownership {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            }),
            None => Err(StoreError::UnknownUser(name.to_string())),
        }
    }

    /// chown `path` unless it already matches
    pub fn apply(&self, path: &Path) -> Result<(), StoreError> {
        let meta = fs::symlink_metadata(path).map_err(at(path))?;
        if meta.uid() == self.uid && meta.gid() == self.gid {
            return Ok(());
        }
        debug!("chown {}:{} {}", self.uid, self.gid, path.display());
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid)).map_err(at(path))
    }
}

/// Well-known paths of one node installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    root: PathBuf,
    unit_path: PathBuf,
}

impl NodeLayout {
    pub fn new(root: impl Into<PathBuf>, unit_path: impl Into<PathBuf>) -> Self {
        NodeLayout {
            root: root.into(),
            unit_path: unit_path.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Service definition file that carries the managed marker
    pub fn unit_path(&self) -> &Path {
        &self.unit_path
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.root.join("identity")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.identity_dir().join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.identity_dir().join(KEY_FILE)
    }

    pub fn signer_key_path(&self) -> PathBuf {
        self.identity_dir().join(SIGNER_KEY_FILE)
    }

    pub fn identity_paths(&self) -> [PathBuf; 3] {
        [self.cert_path(), self.key_path(), self.signer_key_path()]
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join(NODE_CONFIG_FILE)
    }

    pub fn chain_config_dir(&self) -> PathBuf {
        self.config_dir().join("chains")
    }

    pub fn c_chain_config_path(&self) -> PathBuf {
        self.chain_config_dir().join("C").join("config.json")
    }

    pub fn deployment_record_path(&self) -> PathBuf {
        self.config_dir().join(DEPLOYMENT_RECORD_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".avanode.lock")
    }

    /// Managed directories and their target modes
    pub fn directories(&self) -> Vec<(PathBuf, u32)> {
        vec![
            (self.identity_dir(), IDENTITY_DIR_MODE),
            (self.config_dir(), CONFIG_DIR_MODE),
            (self.chain_config_dir().join("C"), CONFIG_DIR_MODE),
            (self.data_dir(), DATA_DIR_MODE),
            (self.log_dir(), LOG_DIR_MODE),
            (self.backups_dir(), BACKUP_DIR_MODE),
        ]
    }

    /// True when any identity or config file is already on disk
    pub fn has_material(&self) -> bool {
        self.identity_paths().iter().any(|p| p.exists()) || self.config_path().exists()
    }

    /// Create the directory tree with target modes and owner.
    ///
    /// Returns the directories that did not exist before this call, outermost
    /// first, so a failed install can remove exactly what it created.
    pub fn ensure_directory_layout(
        &self,
        owner: Option<Ownership>,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut created = Vec::new();

        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(at(&self.root))?;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(ROOT_DIR_MODE))
                .map_err(at(&self.root))?;
            created.push(self.root.clone());
        }

        for (dir, mode) in self.directories() {
            if !dir.exists() {
                // record every missing ancestor below root
                let mut missing = Vec::new();
                let mut cursor = dir.as_path();
                while !cursor.exists() && cursor != self.root {
                    missing.push(cursor.to_path_buf());
                    match cursor.parent() {
                        Some(parent) => cursor = parent,
                        None => break,
                    }
                }
                fs::create_dir_all(&dir).map_err(at(&dir))?;
                for path in missing.into_iter().rev() {
                    if path != dir {
                        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                            .map_err(at(&path))?;
                        if let Some(owner) = owner {
                            owner.apply(&path)?;
                        }
                    }
                    created.push(path);
                }
                info!("Created {}", dir.display());
            }

            let current = fs::metadata(&dir).map_err(at(&dir))?.permissions().mode() & 0o7777;
            if current != mode {
                debug!("chmod {:o} {} (was {:o})", mode, dir.display(), current);
                fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).map_err(at(&dir))?;
            }
            if let Some(owner) = owner {
                owner.apply(&dir)?;
            }
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &Path) -> NodeLayout {
        NodeLayout::new(dir.join("node"), dir.join("avalanchego.service"))
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_layout_paths() {
        let layout = NodeLayout::new("/var/lib/avalanchego", "/etc/systemd/system/avalanchego.service");
        assert_eq!(
            layout.key_path(),
            PathBuf::from("/var/lib/avalanchego/identity/staker.key")
        );
        assert_eq!(
            layout.c_chain_config_path(),
            PathBuf::from("/var/lib/avalanchego/config/chains/C/config.json")
        );
        assert_eq!(layout.lock_path(), PathBuf::from("/var/lib/avalanchego/.avanode.lock"));
    }

    #[test]
    fn test_ensure_layout_creates_dirs_with_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());

        let created = layout.ensure_directory_layout(None).unwrap();
        assert_eq!(created.first(), Some(&layout.root().to_path_buf()));
        assert!(created.contains(&layout.chain_config_dir()));

        assert_eq!(mode_of(&layout.identity_dir()), IDENTITY_DIR_MODE);
        assert_eq!(mode_of(&layout.config_dir()), CONFIG_DIR_MODE);
        assert_eq!(mode_of(&layout.data_dir()), DATA_DIR_MODE);
        assert_eq!(mode_of(&layout.backups_dir()), BACKUP_DIR_MODE);
        assert_eq!(mode_of(&layout.chain_config_dir()), CONFIG_DIR_MODE);
    }

    #[test]
    fn test_ensure_layout_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let owner = Some(Ownership::current());

        layout.ensure_directory_layout(owner).unwrap();
        let before: Vec<u32> = layout.directories().iter().map(|(d, _)| mode_of(d)).collect();

        let created = layout.ensure_directory_layout(owner).unwrap();
        let after: Vec<u32> = layout.directories().iter().map(|(d, _)| mode_of(d)).collect();

        assert!(created.is_empty());
        assert_eq!(before, after);
    }

    #[test]
    fn test_ensure_layout_repairs_wrong_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        layout.ensure_directory_layout(None).unwrap();

        fs::set_permissions(layout.identity_dir(), fs::Permissions::from_mode(0o755)).unwrap();
        layout.ensure_directory_layout(None).unwrap();
        assert_eq!(mode_of(&layout.identity_dir()), IDENTITY_DIR_MODE);
    }

    #[test]
    fn test_has_material() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        layout.ensure_directory_layout(None).unwrap();
        assert!(!layout.has_material());
        fs::write(layout.config_path(), b"{}").unwrap();
        assert!(layout.has_material());
    }

    #[test]
    fn test_unknown_user() {
        let err = Ownership::for_user("no-such-user-avanode-test").unwrap_err();
        assert!(matches!(err, StoreError::UnknownUser(_)));
    }
}
