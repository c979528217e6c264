// NODE IDENTITY MATERIAL
// TLS certificate, TLS private key and BLS signer key of a validator
//
// SAFETY INVARIANTS:
// 1. Private key and signer key are never group or world accessible (0600)
// 2. The certificate may be group readable, never world readable (0640)
// 3. A failed write leaves no new identity file behind
// 4. Secret bytes are zeroized on drop and never formatted

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{at, StoreError};
use crate::layout::{NodeLayout, Ownership, IDENTITY_DIR_MODE};

pub const SECRET_FILE_MODE: u32 = 0o600;
pub const CERT_FILE_MODE: u32 = 0o640;
pub const CONFIG_FILE_MODE: u32 = 0o640;

/// Permission bits that must never be set on secret material
const SECRET_FORBIDDEN: u32 = 0o077;
/// Permission bits that must never be set on the certificate or config
const SHARED_FORBIDDEN: u32 = 0o027;

/// Cryptographic identity of a node on the network
pub struct NodeIdentity {
    /// PEM certificate (public)
    pub certificate: Vec<u8>,

    /// PEM TLS private key
    pub private_key: Zeroizing<Vec<u8>>,

    /// BLS signer key
    pub signer_key: Zeroizing<Vec<u8>>,
}

impl NodeIdentity {
    pub fn new(certificate: Vec<u8>, private_key: Vec<u8>, signer_key: Vec<u8>) -> Self {
        NodeIdentity {
            certificate,
            private_key: Zeroizing::new(private_key),
            signer_key: Zeroizing::new(signer_key),
        }
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .field("signer_key", &"<redacted>")
            .finish()
    }
}

/// How much of the identity is on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPresence {
    Complete,
    Partial,
    Absent,
}

pub fn identity_presence(layout: &NodeLayout) -> IdentityPresence {
    let present = layout.identity_paths().iter().filter(|p| p.is_file()).count();
    match present {
        3 => IdentityPresence::Complete,
        0 => IdentityPresence::Absent,
        _ => IdentityPresence::Partial,
    }
}

pub fn read_identity(layout: &NodeLayout) -> Result<NodeIdentity, StoreError> {
    let missing: Vec<PathBuf> = layout
        .identity_paths()
        .into_iter()
        .filter(|p| !p.is_file())
        .collect();
    if !missing.is_empty() {
        return Err(StoreError::IdentityNotFound { missing });
    }

    let cert_path = layout.cert_path();
    let key_path = layout.key_path();
    let signer_path = layout.signer_key_path();

    Ok(NodeIdentity {
        certificate: fs::read(&cert_path).map_err(at(&cert_path))?,
        private_key: Zeroizing::new(fs::read(&key_path).map_err(at(&key_path))?),
        signer_key: Zeroizing::new(fs::read(&signer_path).map_err(at(&signer_path))?),
    })
}

/// Write one file with its final mode set at creation time.
pub(crate) fn write_restricted(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    // mode() on open is filtered by umask and ignored for existing files
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.new", name))
}

/// Persist the identity with restricted permissions.
///
/// All three files are staged next to their final names with the correct
/// mode and owner, then renamed into place. On any failure every staged or
/// already renamed file from this call is removed.
pub fn write_identity(
    layout: &NodeLayout,
    identity: &NodeIdentity,
    owner: Option<Ownership>,
) -> Result<(), StoreError> {
    let dir = layout.identity_dir();
    fs::create_dir_all(&dir).map_err(at(&dir))?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(IDENTITY_DIR_MODE)).map_err(at(&dir))?;
    if let Some(owner) = owner {
        owner.apply(&dir)?;
    }

    let entries: [(PathBuf, &[u8], u32); 3] = [
        (layout.cert_path(), identity.certificate.as_slice(), CERT_FILE_MODE),
        (layout.key_path(), identity.private_key.as_slice(), SECRET_FILE_MODE),
        (layout.signer_key_path(), identity.signer_key.as_slice(), SECRET_FILE_MODE),
    ];

    let mut staged: Vec<PathBuf> = Vec::new();
    let mut placed: Vec<PathBuf> = Vec::new();

    let result = (|| -> Result<(), StoreError> {
        for (path, bytes, mode) in &entries {
            let tmp = staging_path(path);
            staged.push(tmp.clone());
            write_restricted(&tmp, bytes, *mode).map_err(at(&tmp))?;
            if let Some(owner) = owner {
                owner.apply(&tmp)?;
            }
        }
        for ((path, _, _), tmp) in entries.iter().zip(staged.iter()) {
            fs::rename(tmp, path).map_err(at(path))?;
            placed.push(path.clone());
        }
        Ok(())
    })();

    if let Err(e) = result {
        warn!("Identity write failed, removing partial files: {}", e);
        for path in staged.iter().chain(placed.iter()) {
            let _ = fs::remove_file(path);
        }
        return Err(e);
    }

    info!("Node identity written to {}", dir.display());
    Ok(())
}

/// Why a path failed the permission audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    Missing,
    NotAFile,
    NotADirectory,
    /// Forbidden bits are set
    Mode { actual: u32, forbidden: u32 },
    Owner { expected_uid: u32, actual_uid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionViolation {
    pub path: PathBuf,
    pub kind: ViolationKind,
}

impl fmt::Display for PermissionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{}: missing", self.path.display()),
            ViolationKind::NotAFile => write!(f, "{}: not a regular file", self.path.display()),
            ViolationKind::NotADirectory => write!(f, "{}: not a directory", self.path.display()),
            ViolationKind::Mode { actual, forbidden } => write!(
                f,
                "{}: mode {:o} grants access it must not (forbidden bits {:o}); fix with chmod {:o}",
                self.path.display(),
                actual,
                actual & forbidden,
                actual & !forbidden
            ),
            ViolationKind::Owner {
                expected_uid,
                actual_uid,
            } => write!(
                f,
                "{}: owned by uid {} instead of {}",
                self.path.display(),
                actual_uid,
                expected_uid
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Expect {
    File,
    Dir,
}

fn audit(
    path: &Path,
    expect: Expect,
    forbidden: u32,
    owner: Option<Ownership>,
    out: &mut Vec<PermissionViolation>,
) -> Result<(), StoreError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            out.push(PermissionViolation {
                path: path.to_path_buf(),
                kind: ViolationKind::Missing,
            });
            return Ok(());
        }
        Err(e) => return Err(at(path)(e)),
    };

    let shape_ok = match expect {
        Expect::File => meta.file_type().is_file(),
        Expect::Dir => meta.file_type().is_dir(),
    };
    if !shape_ok {
        out.push(PermissionViolation {
            path: path.to_path_buf(),
            kind: match expect {
                Expect::File => ViolationKind::NotAFile,
                Expect::Dir => ViolationKind::NotADirectory,
            },
        });
        return Ok(());
    }

    let mode = meta.permissions().mode() & 0o7777;
    if mode & forbidden != 0 {
        out.push(PermissionViolation {
            path: path.to_path_buf(),
            kind: ViolationKind::Mode {
                actual: mode,
                forbidden,
            },
        });
    }

    if let Some(owner) = owner {
        if meta.uid() != owner.uid {
            out.push(PermissionViolation {
                path: path.to_path_buf(),
                kind: ViolationKind::Owner {
                    expected_uid: owner.uid,
                    actual_uid: meta.uid(),
                },
            });
        }
    }
    Ok(())
}

/// Audit identity files, the identity directory and the node config.
///
/// An empty list means the layout is safe to back up or start from.
pub fn verify_permissions(
    layout: &NodeLayout,
    owner: Option<Ownership>,
) -> Result<Vec<PermissionViolation>, StoreError> {
    let mut violations = Vec::new();
    audit(&layout.identity_dir(), Expect::Dir, SECRET_FORBIDDEN, owner, &mut violations)?;
    audit(&layout.cert_path(), Expect::File, SHARED_FORBIDDEN, owner, &mut violations)?;
    audit(&layout.key_path(), Expect::File, SECRET_FORBIDDEN, owner, &mut violations)?;
    audit(&layout.signer_key_path(), Expect::File, SECRET_FORBIDDEN, owner, &mut violations)?;
    audit(&layout.config_path(), Expect::File, SHARED_FORBIDDEN, owner, &mut violations)?;
    Ok(violations)
}

/// Reset modes (and owner) of identity and config material to their targets.
pub fn fix_permissions(layout: &NodeLayout, owner: Option<Ownership>) -> Result<(), StoreError> {
    let targets = [
        (layout.identity_dir(), IDENTITY_DIR_MODE),
        (layout.cert_path(), CERT_FILE_MODE),
        (layout.key_path(), SECRET_FILE_MODE),
        (layout.signer_key_path(), SECRET_FILE_MODE),
        (layout.config_path(), CONFIG_FILE_MODE),
        (layout.deployment_record_path(), CONFIG_FILE_MODE),
        (layout.c_chain_config_path(), CONFIG_FILE_MODE),
    ];
    for (path, mode) in targets {
        if !path.exists() {
            continue;
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(at(&path))?;
        if let Some(owner) = owner {
            owner.apply(&path)?;
        }
    }
    Ok(())
}
