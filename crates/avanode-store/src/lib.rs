// === Directory layout and ownership ===
pub mod layout;
pub mod lock;

// === Identity material ===
pub mod identity;

// === Node configuration ===
pub mod config;

pub mod error;

// === Re-exports ===
pub use config::{
    launch_args, parse_existing_config, read_deployment_record, read_observed_config,
    render_chain_config, render_config, write_config, DeploymentRecord, Network, NodeConfig,
    ObservedConfig, Role, RpcScope, DEFAULT_HTTP_PORT, MANAGED_BY,
};
pub use error::StoreError;
pub use identity::{
    fix_permissions, identity_presence, read_identity, verify_permissions, write_identity,
    IdentityPresence, NodeIdentity, PermissionViolation, ViolationKind, CERT_FILE_MODE,
    CONFIG_FILE_MODE, SECRET_FILE_MODE,
};
pub use layout::{NodeLayout, Ownership};
pub use lock::OperationLock;
