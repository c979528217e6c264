// OPERATOR SETTINGS
//
// Layered: built-in defaults, then the TOML settings file, then AVANODE_*
// environment variables. Command-line flags are applied by the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use avanode_backup::DEFAULT_ARCHIVE_TIMEOUT;
use avanode_reconciler::installer::{DEFAULT_LATEST_RELEASE_URL, DEFAULT_RELEASE_BASE_URL};
use avanode_reconciler::{RetryPolicy, DEFAULT_INSTALL_DIR};
use avanode_store::{NodeLayout, DEFAULT_HTTP_PORT};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "/etc/avanode/avanode.toml";
pub const ENV_PREFIX: &str = "AVANODE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub root: PathBuf,
    pub service_name: String,
    pub unit_path: PathBuf,
    pub service_user: String,
    pub install_dir: PathBuf,
    pub release_base_url: String,
    pub latest_release_url: String,
    pub stop_timeout_secs: u64,
    pub settle_secs: u64,
    pub rpc_timeout_secs: u64,
    pub http_port: u16,
    pub keep_snapshots: u64,
    pub fetch_timeout_secs: u64,
    pub fetch_attempts: u32,
    pub fetch_backoff_secs: u64,
    pub archive_timeout_secs: u64,
    pub log_tail_lines: u64,
}

impl Settings {
    /// Load from `file` (or the default location if present) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_from(file, None)
    }

    /// `env` replaces the process environment when given
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("root", "/var/lib/avalanchego")?
            .set_default("service_name", "avalanchego")?
            .set_default("unit_path", "/etc/systemd/system/avalanchego.service")?
            .set_default("service_user", "avalanche")?
            .set_default("install_dir", DEFAULT_INSTALL_DIR)?
            .set_default("release_base_url", DEFAULT_RELEASE_BASE_URL)?
            .set_default("latest_release_url", DEFAULT_LATEST_RELEASE_URL)?
            .set_default("stop_timeout_secs", 300)?
            .set_default("settle_secs", 10)?
            .set_default("rpc_timeout_secs", 120)?
            .set_default("http_port", i64::from(DEFAULT_HTTP_PORT))?
            .set_default("keep_snapshots", 5)?
            .set_default("fetch_timeout_secs", 120)?
            .set_default("fetch_attempts", 3)?
            .set_default("fetch_backoff_secs", 5)?
            .set_default("archive_timeout_secs", DEFAULT_ARCHIVE_TIMEOUT.as_secs())?
            .set_default("log_tail_lines", 200)?;

        builder = match file {
            // an explicit file must exist
            Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml)),
            None => builder.add_source(
                File::new(DEFAULT_SETTINGS_FILE, FileFormat::Toml).required(false),
            ),
        };

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .try_parsing(true)
            .source(env);
        builder = builder.add_source(environment);

        let settings: Settings = builder
            .build()
            .context("failed to read settings")?
            .try_deserialize()
            .context("invalid settings")?;
        Ok(settings)
    }

    pub fn layout(&self) -> NodeLayout {
        NodeLayout::new(&self.root, &self.unit_path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.fetch_attempts, Duration::from_secs(self.fetch_backoff_secs))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }
}
