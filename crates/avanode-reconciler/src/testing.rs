//! Installer double for workflow tests.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use avanode_store::{write_identity, NodeIdentity, NodeLayout};
use parking_lot::Mutex;

use crate::error::InstallError;
use crate::installer::{normalize_tag, previous_path, Installer};

#[derive(Debug, Default)]
struct State {
    version: Option<String>,
    previous: Option<String>,
    fail_installs: u32,
    identities: u32,
}

/// Writes placeholder binaries and tracks versions in memory
#[derive(Debug)]
pub struct FakeInstaller {
    dir: PathBuf,
    state: Mutex<State>,
}

impl FakeInstaller {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FakeInstaller {
            dir: dir.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Pretend `version` is already installed at the default location
    pub fn with_installed(self, version: &str) -> Self {
        fs::create_dir_all(&self.dir).unwrap();
        fs::write(self.default_binary(), version).unwrap();
        self.state.lock().version = Some(normalize_tag(version));
        self
    }

    pub fn fail_installs(&self, times: u32) {
        self.state.lock().fail_installs = times;
    }

    pub fn version(&self) -> Option<String> {
        self.state.lock().version.clone()
    }

    pub fn identities_generated(&self) -> u32 {
        self.state.lock().identities
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    fn default_binary(&self) -> PathBuf {
        self.dir.join("avalanchego")
    }

    async fn install_binary(
        &self,
        binary: &Path,
        version: Option<&str>,
    ) -> Result<String, InstallError> {
        let mut state = self.state.lock();
        if state.fail_installs > 0 {
            state.fail_installs -= 1;
            return Err(InstallError::Status {
                url: "https://releases.invalid/avalanchego.tar.gz".to_string(),
                status: 503,
            });
        }
        let tag = normalize_tag(version.unwrap_or("v1.11.3"));
        if let Some(parent) = binary.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        if binary.exists() {
            fs::rename(binary, previous_path(binary)).unwrap();
        }
        fs::write(binary, &tag).unwrap();
        state.previous = state.version.replace(tag.clone());
        Ok(tag)
    }

    async fn restore_previous(&self, binary: &Path) -> Result<bool, InstallError> {
        let previous = previous_path(binary);
        if !previous.exists() {
            return Ok(false);
        }
        fs::rename(&previous, binary).unwrap();
        let mut state = self.state.lock();
        state.version = state.previous.take();
        Ok(true)
    }

    async fn remove_binary(&self, binary: &Path) -> Result<(), InstallError> {
        let _ = fs::remove_file(binary);
        let _ = fs::remove_file(previous_path(binary));
        self.state.lock().version = None;
        Ok(())
    }

    async fn binary_version(&self, binary: &Path) -> Result<Option<String>, InstallError> {
        if !binary.is_file() {
            return Ok(None);
        }
        Ok(self.state.lock().version.clone())
    }

    async fn generate_identity(&self, _binary: &Path, layout: &NodeLayout) -> Result<(), InstallError> {
        let mut state = self.state.lock();
        state.identities += 1;
        let n = state.identities;
        write_identity(
            layout,
            &NodeIdentity::new(
                format!("cert-{}", n).into_bytes(),
                format!("key-{}", n).into_bytes(),
                format!("signer-{}", n).into_bytes(),
            ),
            None,
        )?;
        Ok(())
    }
}
