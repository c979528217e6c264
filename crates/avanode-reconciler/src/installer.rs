// NODE BINARY INSTALLER
//
// SAFETY INVARIANTS:
// 1. Every download has a request timeout and a bounded number of attempts
// 2. The live binary is replaced by rename, only after the new one is fully extracted
// 3. The replaced binary is kept as <binary>.prev until the next install
// 4. Identity generation never runs over existing identity files

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use avanode_store::{identity_presence, IdentityPresence, NodeLayout};
use avanode_supervisor::run_checked;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::retry::{retry_fixed, RetryPolicy};

pub const BINARY_NAME: &str = "avalanchego";

pub const DEFAULT_INSTALL_DIR: &str = "/usr/local/lib/avalanchego";

pub const DEFAULT_RELEASE_BASE_URL: &str = "https://github.com/ava-labs/avalanchego/releases/download";

pub const DEFAULT_LATEST_RELEASE_URL: &str =
    "https://api.github.com/repos/ava-labs/avalanchego/releases/latest";

/// Bound on a node's first start while it writes its identity
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(60);

const BINARY_MODE: u32 = 0o755;
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const IDENTITY_POLL: Duration = Duration::from_millis(250);

/// Identity files are written one after another; give the last write time
/// to finish before the process is stopped.
const IDENTITY_GRACE: Duration = Duration::from_millis(500);

const USER_AGENT: &str = concat!("avanode/", env!("CARGO_PKG_VERSION"));

/// Places node binaries and bootstraps identities
#[async_trait]
pub trait Installer: Send + Sync {
    /// Where a fresh install puts the binary
    fn default_binary(&self) -> PathBuf;

    /// Install `version` (latest when `None`) at `binary`. Returns the
    /// installed release tag.
    async fn install_binary(&self, binary: &Path, version: Option<&str>)
        -> Result<String, InstallError>;

    /// Put `<binary>.prev` back in place. `Ok(false)` when there is none.
    async fn restore_previous(&self, binary: &Path) -> Result<bool, InstallError>;

    /// Remove a binary this tool installed, with its `.prev`
    async fn remove_binary(&self, binary: &Path) -> Result<(), InstallError>;

    /// Release tag reported by `binary --version`; `None` when absent
    async fn binary_version(&self, binary: &Path) -> Result<Option<String>, InstallError>;

    /// Start the node once so it writes its certificate and keys, then stop it.
    async fn generate_identity(&self, binary: &Path, layout: &NodeLayout) -> Result<(), InstallError>;
}

/// `v1.11.3` for `1.11.3` or `v1.11.3`
pub fn normalize_tag(version: &str) -> String {
    let version = version.trim();
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

pub fn release_asset(tag: &str, arch: &str) -> String {
    format!("avalanchego-linux-{}-{}.tar.gz", arch, tag)
}

fn linux_arch() -> Result<&'static str, InstallError> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("amd64"),
        "aarch64" => Ok("arm64"),
        other => Err(InstallError::BadRelease(format!(
            "no AvalancheGo release for architecture {}",
            other
        ))),
    }
}

/// Parse `avalanchego/1.11.3 [database=v1.4.5, ...]` into `v1.11.3`.
pub fn parse_version_output(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?.trim();
    let (name, rest) = first.split_once('/')?;
    if name != BINARY_NAME {
        return None;
    }
    let version = rest.split_whitespace().next()?;
    if version.is_empty() || !version.trim_start_matches('v').starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(normalize_tag(version))
}

pub fn previous_path(binary: &Path) -> PathBuf {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| BINARY_NAME.to_string());
    binary.with_file_name(format!("{}.prev", name))
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// Installs official release tarballs
pub struct ReleaseInstaller {
    client: reqwest::Client,
    install_dir: PathBuf,
    base_url: String,
    latest_url: String,
    retry: RetryPolicy,
    identity_timeout: Duration,
}

impl ReleaseInstaller {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        fetch_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(ReleaseInstaller {
            client,
            install_dir: install_dir.into(),
            base_url: DEFAULT_RELEASE_BASE_URL.to_string(),
            latest_url: DEFAULT_LATEST_RELEASE_URL.to_string(),
            retry,
            identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
        })
    }

    /// Use a mirror instead of GitHub releases
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_latest_url(mut self, latest_url: impl Into<String>) -> Self {
        self.latest_url = latest_url.into();
        self
    }

    pub fn with_identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = timeout;
        self
    }

    /// Release tag to install: the requested one, or the latest published
    pub async fn resolve_version(&self, requested: Option<&str>) -> Result<String, InstallError> {
        match requested {
            Some(version) if !version.eq_ignore_ascii_case("latest") => Ok(normalize_tag(version)),
            _ => {
                let url = self.latest_url.as_str();
                let release: LatestRelease = retry_fixed(
                    &self.retry,
                    "latest release lookup",
                    |_| async move {
                        let bytes = self.fetch(url).await?;
                        serde_json::from_slice::<LatestRelease>(&bytes).map_err(|e| {
                            InstallError::BadRelease(format!("unreadable release metadata: {}", e))
                        })
                    },
                    InstallError::is_transient,
                )
                .await?;
                info!("Latest AvalancheGo release is {}", release.tag_name);
                Ok(normalize_tag(&release.tag_name))
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, InstallError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Extract `archive` and swap its binary in at `binary`.
    pub async fn install_archive(
        &self,
        archive: &Path,
        binary: &Path,
        tag: &str,
    ) -> Result<(), InstallError> {
        let parent = binary
            .parent()
            .ok_or_else(|| InstallError::BadRelease(format!("{} has no parent", binary.display())))?;
        let staging = parent.join(format!(".staging-{}", tag));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(io_at(&staging))?;
        }
        fs::create_dir_all(&staging).map_err(io_at(&staging))?;

        let result = swap_in(archive, &staging, binary).await;
        if let Err(e) = fs::remove_dir_all(&staging) {
            warn!("Could not remove {}: {}", staging.display(), e);
        }
        result
    }
}

async fn swap_in(archive: &Path, staging: &Path, binary: &Path) -> Result<(), InstallError> {
    let archive_arg = archive.to_string_lossy().into_owned();
    let staging_arg = staging.to_string_lossy().into_owned();
    run_checked(
        "tar",
        &[
            "-xzf",
            archive_arg.as_str(),
            "-C",
            staging_arg.as_str(),
            "--strip-components=1",
        ],
        None,
    )
    .await?;

    let extracted = staging.join(BINARY_NAME);
    if !extracted.is_file() {
        return Err(InstallError::BadRelease(format!(
            "archive {} has no {} binary",
            archive.display(),
            BINARY_NAME
        )));
    }
    fs::set_permissions(&extracted, fs::Permissions::from_mode(BINARY_MODE))
        .map_err(io_at(&extracted))?;

    let previous = previous_path(binary);
    if binary.exists() {
        fs::rename(binary, &previous).map_err(io_at(binary))?;
    }
    if let Err(e) = fs::rename(&extracted, binary) {
        if previous.exists() {
            let _ = fs::rename(&previous, binary);
        }
        return Err(io_at(binary)(e));
    }
    Ok(())
}

#[async_trait]
impl Installer for ReleaseInstaller {
    fn default_binary(&self) -> PathBuf {
        self.install_dir.join(BINARY_NAME)
    }

    async fn install_binary(
        &self,
        binary: &Path,
        version: Option<&str>,
    ) -> Result<String, InstallError> {
        let tag = self.resolve_version(version).await?;
        let asset = release_asset(&tag, linux_arch()?);
        let url = format!("{}/{}/{}", self.base_url.trim_end_matches('/'), tag, asset);
        info!("Downloading {}", url);

        let parent = binary
            .parent()
            .ok_or_else(|| InstallError::BadRelease(format!("{} has no parent", binary.display())))?;
        fs::create_dir_all(parent).map_err(io_at(parent))?;

        let url_ref = url.as_str();
        let bytes = retry_fixed(
            &self.retry,
            "release download",
            |_| self.fetch(url_ref),
            InstallError::is_transient,
        )
        .await?;

        let download = parent.join(format!(".{}", asset));
        fs::write(&download, &bytes).map_err(io_at(&download))?;
        let result = self.install_archive(&download, binary, &tag).await;
        if let Err(e) = fs::remove_file(&download) {
            warn!("Could not remove {}: {}", download.display(), e);
        }
        result?;

        info!("Installed AvalancheGo {} at {}", tag, binary.display());
        Ok(tag)
    }

    async fn restore_previous(&self, binary: &Path) -> Result<bool, InstallError> {
        let previous = previous_path(binary);
        if !previous.is_file() {
            return Ok(false);
        }
        fs::rename(&previous, binary).map_err(io_at(binary))?;
        info!("Restored previous binary at {}", binary.display());
        Ok(true)
    }

    async fn remove_binary(&self, binary: &Path) -> Result<(), InstallError> {
        for path in [binary.to_path_buf(), previous_path(binary)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_at(&path)(e)),
            }
        }
        if let Some(parent) = binary.parent() {
            // only succeeds when nothing else lives there
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    async fn binary_version(&self, binary: &Path) -> Result<Option<String>, InstallError> {
        if !binary.is_file() {
            return Ok(None);
        }
        let program = binary.to_string_lossy().into_owned();
        let output = run_checked(&program, &["--version"], Some(VERSION_TIMEOUT)).await?;
        Ok(parse_version_output(&output.stdout).or_else(|| {
            let raw = output.stdout.trim();
            (!raw.is_empty()).then(|| raw.to_string())
        }))
    }

    async fn generate_identity(&self, binary: &Path, layout: &NodeLayout) -> Result<(), InstallError> {
        if identity_presence(layout) != IdentityPresence::Absent {
            return Err(InstallError::IdentityPresent(layout.identity_dir()));
        }
        if !binary.is_file() {
            return Err(InstallError::MissingBinary(binary.to_path_buf()));
        }

        info!("Starting {} once to generate the node identity", binary.display());
        let mut child = tokio::process::Command::new(binary)
            .arg(format!("--config-file={}", layout.config_path().display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_at(binary))?;

        let started = Instant::now();
        let outcome = loop {
            if identity_presence(layout) == IdentityPresence::Complete {
                tokio::time::sleep(IDENTITY_GRACE).await;
                break Ok(());
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    break if identity_presence(layout) == IdentityPresence::Complete {
                        Ok(())
                    } else {
                        Err(InstallError::BadRelease(format!(
                            "node exited with {} before writing its identity",
                            status
                        )))
                    };
                }
                Ok(None) => {}
                Err(e) => break Err(io_at(binary)(e)),
            }
            if started.elapsed() >= self.identity_timeout {
                break Err(InstallError::IdentityTimeout(self.identity_timeout));
            }
            tokio::time::sleep(IDENTITY_POLL).await;
        };

        if let Err(e) = child.kill().await {
            debug!("Identity bootstrap process already gone: {}", e);
        }
        if outcome.is_ok() {
            info!("Node identity written to {}", layout.identity_dir().display());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avanode_store::{write_identity, NodeIdentity};
    use std::process::Command;

    fn installer(dir: &Path) -> ReleaseInstaller {
        ReleaseInstaller::new(dir, Duration::from_secs(5), RetryPolicy::new(1, Duration::ZERO))
            .unwrap()
            .with_identity_timeout(Duration::from_secs(10))
    }

    /// Release-shaped tarball: `<top>/avalanchego` plus a README
    fn release_tarball(dir: &Path, name: &str, content: &str, with_binary: bool) -> PathBuf {
        let top = dir.join(format!("src-{}", name)).join("avalanchego-release");
        fs::create_dir_all(&top).unwrap();
        if with_binary {
            fs::write(top.join(BINARY_NAME), content).unwrap();
        }
        fs::write(top.join("README.md"), "release notes").unwrap();
        let archive = dir.join(format!("{}.tar.gz", name));
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(top.parent().unwrap())
            .arg("avalanchego-release")
            .status()
            .unwrap();
        assert!(status.success());
        archive
    }

    #[test]
    fn test_release_naming() {
        assert_eq!(normalize_tag("1.11.3"), "v1.11.3");
        assert_eq!(normalize_tag("v1.11.3"), "v1.11.3");
        assert_eq!(
            release_asset("v1.11.3", "amd64"),
            "avalanchego-linux-amd64-v1.11.3.tar.gz"
        );
        assert_eq!(
            previous_path(Path::new("/opt/avalanchego/avalanchego")),
            PathBuf::from("/opt/avalanchego/avalanchego.prev")
        );
    }

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("avalanchego/1.11.3 [database=v1.4.5, rpcchainvm=35, commit=0d1b8e, go=1.21.7]\n"),
            Some("v1.11.3".to_string())
        );
        assert_eq!(parse_version_output("avalanchego/v1.10.0"), Some("v1.10.0".to_string()));
        assert_eq!(parse_version_output("something else"), None);
        assert_eq!(parse_version_output("other/1.0.0"), None);
        assert_eq!(parse_version_output(""), None);
    }

    #[tokio::test]
    async fn test_explicit_version_needs_no_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(tmp.path());
        assert_eq!(installer.resolve_version(Some("1.11.3")).await.unwrap(), "v1.11.3");
        assert_eq!(installer.default_binary(), tmp.path().join(BINARY_NAME));
    }

    #[tokio::test]
    async fn test_install_archive_keeps_previous_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(&tmp.path().join("bin"));
        let binary = installer.default_binary();
        fs::create_dir_all(binary.parent().unwrap()).unwrap();

        let first = release_tarball(tmp.path(), "one", "first build", true);
        installer.install_archive(&first, &binary, "v1.0.0").await.unwrap();
        assert_eq!(fs::read_to_string(&binary).unwrap(), "first build");
        let mode = fs::metadata(&binary).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, BINARY_MODE);
        assert!(!previous_path(&binary).exists());

        let second = release_tarball(tmp.path(), "two", "second build", true);
        installer.install_archive(&second, &binary, "v1.0.1").await.unwrap();
        assert_eq!(fs::read_to_string(&binary).unwrap(), "second build");
        assert_eq!(fs::read_to_string(previous_path(&binary)).unwrap(), "first build");

        assert!(installer.restore_previous(&binary).await.unwrap());
        assert_eq!(fs::read_to_string(&binary).unwrap(), "first build");
        assert!(!installer.restore_previous(&binary).await.unwrap());

        // no staging leftovers next to the binary
        let leftovers: Vec<_> = fs::read_dir(binary.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_archive_without_binary_leaves_install_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(&tmp.path().join("bin"));
        let binary = installer.default_binary();
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, "current").unwrap();

        let broken = release_tarball(tmp.path(), "broken", "", false);
        let err = installer
            .install_archive(&broken, &binary, "v9.9.9")
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::BadRelease(_)));
        assert_eq!(fs::read_to_string(&binary).unwrap(), "current");
        assert!(!previous_path(&binary).exists());
    }

    #[tokio::test]
    async fn test_remove_binary_and_missing_version() {
        let tmp = tempfile::tempdir().unwrap();
        let installer = installer(&tmp.path().join("bin"));
        let binary = installer.default_binary();
        assert_eq!(installer.binary_version(&binary).await.unwrap(), None);

        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, "x").unwrap();
        fs::write(previous_path(&binary), "y").unwrap();
        installer.remove_binary(&binary).await.unwrap();
        assert!(!binary.exists());
        assert!(!previous_path(&binary).exists());
        assert!(!binary.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_generate_identity_refuses_existing_material() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("node.service"));
        layout.ensure_directory_layout(None).unwrap();
        write_identity(
            &layout,
            &NodeIdentity::new(b"cert".to_vec(), b"key".to_vec(), b"signer".to_vec()),
            None,
        )
        .unwrap();

        let installer = installer(tmp.path());
        let err = installer
            .generate_identity(&installer.default_binary(), &layout)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::IdentityPresent(_)));
    }

    #[tokio::test]
    async fn test_generate_identity_stops_after_files_appear() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("node.service"));
        layout.ensure_directory_layout(None).unwrap();

        let script = tmp.path().join("fake-node");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho cert > '{}'\necho key > '{}'\necho signer > '{}'\nexec sleep 30\n",
                layout.cert_path().display(),
                layout.key_path().display(),
                layout.signer_key_path().display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let installer = installer(tmp.path());
        let started = Instant::now();
        installer.generate_identity(&script, &layout).await.unwrap();
        assert_eq!(identity_presence(&layout), IdentityPresence::Complete);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_generate_identity_reports_early_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(tmp.path().join("node"), tmp.path().join("node.service"));
        layout.ensure_directory_layout(None).unwrap();

        let script = tmp.path().join("broken-node");
        fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let installer = installer(tmp.path());
        let err = installer.generate_identity(&script, &layout).await.unwrap_err();
        assert!(matches!(err, InstallError::BadRelease(_)));
    }
}
