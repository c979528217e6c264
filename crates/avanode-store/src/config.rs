// NODE CONFIGURATION
// Typed configuration for the AvalancheGo process and its JSON rendering
//
// SAFETY INVARIANTS:
// 1. Rendering is pure and deterministic for a given NodeConfig
// 2. Flags and JSON keys come from one mapping (NodeConfig::settings)
// 3. Every role defaults to loopback-only RPC

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{at, StoreError};
use crate::identity::{write_restricted, CONFIG_FILE_MODE};
use crate::layout::{NodeLayout, Ownership};

pub const DEFAULT_HTTP_PORT: u16 = 9650;
pub const DEFAULT_STAKING_PORT: u16 = 9651;

/// Value of `managed_by` in the deployment record
pub const MANAGED_BY: &str = "avanode";

/// Network the node joins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Local,
}

impl Network {
    /// Value of AvalancheGo's `network-id` setting
    pub fn network_id(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "fuji",
            Network::Local => "local",
        }
    }

    /// Inverse of [`Network::network_id`], also accepting numeric ids
    pub fn from_network_id(id: &str) -> Option<Network> {
        match id.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "1" => Some(Network::Mainnet),
            "fuji" | "testnet" | "5" => Some(Network::Testnet),
            "local" | "12345" => Some(Network::Local),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Local => "local",
        })
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::from_network_id(s)
            .ok_or_else(|| format!("unknown network `{}` (expected mainnet, testnet or local)", s))
    }
}

/// Operational role of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Validator,
    Archival,
    Api,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Validator => "validator",
            Role::Archival => "archival",
            Role::Api => "api",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validator" => Ok(Role::Validator),
            "archival" | "archive" => Ok(Role::Archival),
            "api" | "rpc" => Ok(Role::Api),
            _ => Err(format!(
                "unknown role `{}` (expected validator, archival or api)",
                s
            )),
        }
    }
}

/// Interfaces the HTTP/RPC server binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcScope {
    Loopback,
    Public,
}

impl RpcScope {
    pub fn http_host(&self) -> &'static str {
        match self {
            RpcScope::Loopback => "127.0.0.1",
            RpcScope::Public => "0.0.0.0",
        }
    }

    fn from_http_host(host: &str) -> RpcScope {
        match host.trim() {
            "127.0.0.1" | "localhost" | "::1" => RpcScope::Loopback,
            _ => RpcScope::Public,
        }
    }
}

impl fmt::Display for RpcScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RpcScope::Loopback => "loopback",
            RpcScope::Public => "public",
        })
    }
}

impl FromStr for RpcScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loopback" | "private" | "local" => Ok(RpcScope::Loopback),
            "public" | "all" => Ok(RpcScope::Public),
            _ => Err(format!("unknown rpc scope `{}` (expected loopback or public)", s)),
        }
    }
}

/// Declarative configuration of the node process.
///
/// Built once per install/upgrade/migrate and passed by value; nothing
/// mutates it after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,
    pub role: Role,
    pub rpc_scope: RpcScope,
    pub state_sync: bool,
    pub indexing: bool,
    pub pruning: bool,
    pub http_port: u16,
    pub staking_port: u16,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub identity_dir: PathBuf,
    pub chain_config_dir: PathBuf,
}

impl NodeConfig {
    /// Role defaults: archival nodes keep full history, everything else
    /// state-syncs and prunes. RPC is loopback-only for every role.
    pub fn for_role(role: Role, network: Network, layout: &NodeLayout) -> Self {
        let (state_sync, pruning, indexing) = match role {
            Role::Validator => (true, true, false),
            Role::Archival => (false, false, true),
            Role::Api => (true, true, true),
        };

        NodeConfig {
            network,
            role,
            rpc_scope: RpcScope::Loopback,
            state_sync,
            indexing,
            pruning,
            http_port: DEFAULT_HTTP_PORT,
            staking_port: DEFAULT_STAKING_PORT,
            data_dir: layout.data_dir(),
            log_dir: layout.log_dir(),
            identity_dir: layout.identity_dir(),
            chain_config_dir: layout.chain_config_dir(),
        }
    }

    pub fn with_rpc_scope(mut self, scope: RpcScope) -> Self {
        self.rpc_scope = scope;
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    fn path_value(path: &Path) -> Value {
        Value::String(path.to_string_lossy().into_owned())
    }

    /// Node settings as (flag name, value) pairs. JSON keys and command-line
    /// flags of AvalancheGo share these names.
    pub fn settings(&self) -> Vec<(&'static str, Value)> {
        let mut settings = vec![
            ("network-id", json!(self.network.network_id())),
            ("http-host", json!(self.rpc_scope.http_host())),
            ("http-port", json!(self.http_port)),
            ("staking-port", json!(self.staking_port)),
            ("db-dir", Self::path_value(&self.data_dir)),
            ("log-dir", Self::path_value(&self.log_dir)),
            ("chain-config-dir", Self::path_value(&self.chain_config_dir)),
            (
                "staking-tls-cert-file",
                Self::path_value(&self.identity_dir.join(crate::layout::CERT_FILE)),
            ),
            (
                "staking-tls-key-file",
                Self::path_value(&self.identity_dir.join(crate::layout::KEY_FILE)),
            ),
            (
                "staking-signer-key-file",
                Self::path_value(&self.identity_dir.join(crate::layout::SIGNER_KEY_FILE)),
            ),
            ("index-enabled", json!(self.indexing)),
            ("api-admin-enabled", json!(false)),
            ("public-ip-resolution-service", json!("opendns")),
        ];
        if self.rpc_scope == RpcScope::Public {
            settings.push(("http-allowed-hosts", json!("*")));
        }
        settings
    }

    /// Same settings as `--key=value` arguments
    pub fn to_flags(&self) -> Vec<String> {
        self.settings()
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("--{}={}", key, s),
                other => format!("--{}={}", key, other),
            })
            .collect()
    }
}

/// Render the node's `node.json` document.
pub fn render_config(config: &NodeConfig) -> Value {
    let mut doc = Map::new();
    for (key, value) in config.settings() {
        doc.insert(key.to_string(), value);
    }
    Value::Object(doc)
}

/// Render the C-Chain `config.json` document.
pub fn render_chain_config(config: &NodeConfig) -> Value {
    let apis: &[&str] = match config.role {
        Role::Validator => &["eth", "eth-filter", "net", "web3"],
        Role::Archival | Role::Api => &[
            "eth",
            "eth-filter",
            "net",
            "web3",
            "internal-eth",
            "internal-blockchain",
            "internal-transaction",
        ],
    };
    json!({
        "state-sync-enabled": config.state_sync,
        "pruning-enabled": config.pruning,
        "eth-apis": apis,
        "log-level": "info",
    })
}

/// Arguments for the service's ExecStart line; node.json is the single
/// source of truth for everything else.
pub fn launch_args(layout: &NodeLayout) -> Vec<String> {
    vec![format!("--config-file={}", layout.config_path().display())]
}

/// This tool's record of what it deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub managed_by: String,
    pub role: Role,
    pub network: Network,
    pub rpc_scope: RpcScope,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_version: Option<String>,
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl DeploymentRecord {
    /// Node configuration this record describes, rebuilt for `layout`
    pub fn to_config(&self, layout: &NodeLayout) -> NodeConfig {
        NodeConfig::for_role(self.role, self.network, layout)
            .with_rpc_scope(self.rpc_scope)
            .with_http_port(self.http_port)
    }

    pub fn for_config(config: &NodeConfig, binary_version: Option<String>) -> Self {
        DeploymentRecord {
            managed_by: MANAGED_BY.to_string(),
            role: config.role,
            network: config.network,
            rpc_scope: config.rpc_scope,
            http_port: config.http_port,
            binary_version,
        }
    }
}

/// What can be recovered from a node.json this tool may not have written,
/// plus the C-Chain config it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedConfig {
    pub network: Option<Network>,
    pub rpc_scope: RpcScope,
    pub http_port: Option<u16>,
    pub indexing: bool,
    pub chain_config_dir: Option<PathBuf>,
    pub pruning: Option<bool>,
    pub state_sync: Option<bool>,
}

impl ObservedConfig {
    /// Closest role: indexing without pruning is archival, indexing with
    /// pruning (or unknown pruning) is api, no indexing is validator.
    pub fn role(&self) -> Role {
        match (self.indexing, self.pruning) {
            (true, Some(false)) => Role::Archival,
            (true, _) => Role::Api,
            (false, _) => Role::Validator,
        }
    }

    /// Fold in the C-Chain `config.json`.
    pub fn with_chain_config(mut self, text: &str) -> Result<Self, StoreError> {
        let doc: Value = serde_json::from_str(text)?;
        let obj = doc.as_object().ok_or_else(|| {
            StoreError::InvalidConfig("C-Chain config is not a JSON object".to_string())
        })?;
        self.pruning = obj.get("pruning-enabled").and_then(Value::as_bool);
        self.state_sync = obj.get("state-sync-enabled").and_then(Value::as_bool);
        Ok(self)
    }
}

pub fn parse_existing_config(text: &str) -> Result<ObservedConfig, StoreError> {
    let doc: Value = serde_json::from_str(text)?;
    let obj = doc
        .as_object()
        .ok_or_else(|| StoreError::InvalidConfig("node.json is not a JSON object".to_string()))?;

    let network = obj
        .get("network-id")
        .and_then(|v| match v {
            Value::String(s) => Network::from_network_id(s),
            Value::Number(n) => Network::from_network_id(&n.to_string()),
            _ => None,
        });
    let rpc_scope = obj
        .get("http-host")
        .and_then(Value::as_str)
        .map(RpcScope::from_http_host)
        .unwrap_or(RpcScope::Loopback);
    let http_port = obj
        .get("http-port")
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .and_then(|port| u16::try_from(port).ok());
    let indexing = obj
        .get("index-enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let chain_config_dir = obj
        .get("chain-config-dir")
        .and_then(Value::as_str)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from);

    Ok(ObservedConfig {
        network,
        rpc_scope,
        http_port,
        indexing,
        chain_config_dir,
        pruning: None,
        state_sync: None,
    })
}

fn write_json_atomic(path: &Path, doc: &Value, owner: Option<Ownership>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(at(parent))?;
    }
    let mut bytes = serde_json::to_vec_pretty(doc)?;
    bytes.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    let written = write_restricted(&tmp, &bytes, CONFIG_FILE_MODE)
        .map_err(at(&tmp))
        .and_then(|_| match owner {
            Some(owner) => owner.apply(&tmp),
            None => Ok(()),
        })
        .and_then(|_| fs::rename(&tmp, path).map_err(at(path)));

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Persist node.json, the C-Chain config and the deployment record.
pub fn write_config(
    layout: &NodeLayout,
    config: &NodeConfig,
    record: &DeploymentRecord,
    owner: Option<Ownership>,
) -> Result<(), StoreError> {
    write_json_atomic(&layout.c_chain_config_path(), &render_chain_config(config), owner)?;
    write_json_atomic(&layout.config_path(), &render_config(config), owner)?;
    write_json_atomic(
        &layout.deployment_record_path(),
        &serde_json::to_value(record)?,
        owner,
    )?;
    debug!(
        "Wrote {} config for {} on {}",
        layout.config_path().display(),
        config.role,
        config.network
    );
    Ok(())
}

pub fn read_deployment_record(layout: &NodeLayout) -> Result<Option<DeploymentRecord>, StoreError> {
    let path = layout.deployment_record_path();
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(at(&path)(e)),
    }
}

pub fn read_observed_config(layout: &NodeLayout) -> Result<Option<ObservedConfig>, StoreError> {
    let path = layout.config_path();
    let observed = match fs::read_to_string(&path) {
        Ok(text) => parse_existing_config(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(at(&path)(e)),
    };

    let chain_path = match &observed.chain_config_dir {
        Some(dir) => dir.join("C").join("config.json"),
        None => layout.c_chain_config_path(),
    };
    match fs::read_to_string(&chain_path) {
        Ok(text) => observed.with_chain_config(&text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Some(observed)),
        Err(e) => Err(at(&chain_path)(e)),
    }
}
