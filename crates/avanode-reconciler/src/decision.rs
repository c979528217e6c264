// ACTION SELECTION
//
// SAFETY INVARIANTS:
// 1. reconcile() is pure: same host state and intent, same decision
// 2. An action outside the phase's offered set is refused, never coerced
// 3. Restore is never offered before a deployment is managed
// 4. A validator never gets public RPC without explicit confirmation
// 5. Migrate never proceeds without a complete identity to carry forward

use std::fmt;

use avanode_backup::SnapshotId;
use avanode_store::{
    IdentityPresence, Network, NodeConfig, NodeLayout, Role, RpcScope, DEFAULT_HTTP_PORT,
};

use crate::host::{HostPhase, HostState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Install,
    Upgrade,
    Migrate,
    Backup,
    Restore,
    RegenerateIdentity,
    Cancel,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Install => "install",
            ActionKind::Upgrade => "upgrade",
            ActionKind::Migrate => "migrate",
            ActionKind::Backup => "backup",
            ActionKind::Restore => "restore",
            ActionKind::RegenerateIdentity => "regenerate-identity",
            ActionKind::Cancel => "cancel",
        })
    }
}

/// Requested RPC exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcRequest {
    pub scope: RpcScope,

    /// Operator explicitly accepted public RPC on a validator
    pub confirm_public: bool,
}

impl RpcRequest {
    pub fn loopback() -> Self {
        RpcRequest {
            scope: RpcScope::Loopback,
            confirm_public: false,
        }
    }
}

/// What the operator asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Install {
        role: Role,
        network: Network,
        rpc: RpcRequest,
        http_port: u16,
        version: Option<String>,
    },
    Upgrade {
        version: Option<String>,
    },
    Migrate {
        role: Role,
        /// Falls back to the network read from the existing node.json
        network: Option<Network>,
        /// Falls back to the existing deployment's exposure
        rpc: Option<RpcRequest>,
        http_port: u16,
    },
    Backup {
        include_data: bool,
    },
    Restore {
        snapshot: SnapshotId,
        restore_data: bool,
    },
    RegenerateIdentity,
    Cancel,
}

impl Intent {
    pub fn kind(&self) -> ActionKind {
        match self {
            Intent::Install { .. } => ActionKind::Install,
            Intent::Upgrade { .. } => ActionKind::Upgrade,
            Intent::Migrate { .. } => ActionKind::Migrate,
            Intent::Backup { .. } => ActionKind::Backup,
            Intent::Restore { .. } => ActionKind::Restore,
            Intent::RegenerateIdentity => ActionKind::RegenerateIdentity,
            Intent::Cancel => ActionKind::Cancel,
        }
    }
}

/// A fully resolved step for the driver to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Install {
        config: NodeConfig,
        version: Option<String>,
    },
    /// `config: None` replaces only the binary (unmanaged deployments)
    Upgrade {
        config: Option<NodeConfig>,
        version: Option<String>,
    },
    Migrate {
        config: NodeConfig,
    },
    Backup {
        include_data: bool,
    },
    Restore {
        snapshot: SnapshotId,
        restore_data: bool,
    },
    RegenerateIdentity,
    Cancel,
    Refuse {
        reason: String,
        offered: Vec<ActionKind>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,

    /// Adjustments the operator should hear about
    pub warnings: Vec<String>,
}

impl Decision {
    fn go(action: Action) -> Self {
        Decision {
            action,
            warnings: Vec::new(),
        }
    }

    fn refuse(reason: impl Into<String>, offered: Vec<ActionKind>) -> Self {
        Decision::go(Action::Refuse {
            reason: reason.into(),
            offered,
        })
    }

    fn warn(mut self, warning: Option<String>) -> Self {
        self.warnings.extend(warning);
        self
    }
}

/// Actions available to the operator in each phase
pub fn offered_actions(phase: HostPhase) -> Vec<ActionKind> {
    match phase {
        HostPhase::Uninstalled => vec![ActionKind::Install, ActionKind::Cancel],
        HostPhase::InstalledUnmanaged => vec![
            ActionKind::Backup,
            ActionKind::Migrate,
            ActionKind::Upgrade,
            ActionKind::Cancel,
        ],
        HostPhase::ManagedRunning | HostPhase::ManagedStopped => vec![
            ActionKind::Backup,
            ActionKind::Upgrade,
            ActionKind::Restore,
            ActionKind::RegenerateIdentity,
            ActionKind::Cancel,
        ],
    }
}

/// Apply the RPC exposure policy.
///
/// A validator asking for public RPC without confirmation is downgraded to
/// loopback; the returned warning says so.
pub fn resolve_rpc_scope(role: Role, rpc: RpcRequest) -> (RpcScope, Option<String>) {
    match (role, rpc.scope, rpc.confirm_public) {
        (Role::Validator, RpcScope::Public, false) => (
            RpcScope::Loopback,
            Some(
                "public RPC on a validator needs explicit confirmation; binding RPC to loopback instead"
                    .to_string(),
            ),
        ),
        (_, scope, _) => (scope, None),
    }
}

fn not_offered(phase: HostPhase, kind: ActionKind) -> String {
    match (phase, kind) {
        (HostPhase::Uninstalled, _) => {
            format!("nothing is installed here, so {} does not apply; install first", kind)
        }
        (HostPhase::InstalledUnmanaged, ActionKind::Restore)
        | (HostPhase::InstalledUnmanaged, ActionKind::RegenerateIdentity) => format!(
            "{} is offered only after migrate has brought this deployment under management",
            kind
        ),
        (HostPhase::InstalledUnmanaged, ActionKind::Install) => {
            "a node is already installed here; use migrate to take it over".to_string()
        }
        (_, ActionKind::Install) => "a managed node is already installed here; use upgrade".to_string(),
        (_, ActionKind::Migrate) => "this deployment is already managed".to_string(),
        _ => format!("{} is not available while the host is {}", kind, phase),
    }
}

/// Pick the action for `intent` given what is on the host.
pub fn reconcile(state: &HostState, intent: &Intent, layout: &NodeLayout) -> Decision {
    let offered = offered_actions(state.phase);
    let kind = intent.kind();
    if !offered.contains(&kind) {
        return Decision::refuse(not_offered(state.phase, kind), offered);
    }

    match intent {
        Intent::Install {
            role,
            network,
            rpc,
            http_port,
            version,
        } => {
            let (scope, warning) = resolve_rpc_scope(*role, *rpc);
            let config = NodeConfig::for_role(*role, *network, layout)
                .with_rpc_scope(scope)
                .with_http_port(*http_port);
            Decision::go(Action::Install {
                config,
                version: version.clone(),
            })
            .warn(warning)
        }

        Intent::Upgrade { version } => plan_upgrade(state, version.clone(), layout, offered),

        Intent::Migrate {
            role,
            network,
            rpc,
            http_port,
        } => {
            if state.identity != IdentityPresence::Complete {
                return Decision::refuse(
                    format!(
                        "migrate carries the existing identity forward, but it is {}",
                        match state.identity {
                            IdentityPresence::Partial => "incomplete",
                            _ => "missing",
                        }
                    ),
                    offered,
                );
            }
            let Some(network) = network.or_else(|| state.network()) else {
                return Decision::refuse(
                    "the network of the existing deployment cannot be read; pass it explicitly",
                    offered,
                );
            };
            let rpc = rpc.unwrap_or(RpcRequest {
                scope: state.rpc_scope().unwrap_or(RpcScope::Loopback),
                confirm_public: false,
            });
            let (scope, warning) = resolve_rpc_scope(*role, rpc);
            let config = NodeConfig::for_role(*role, network, layout)
                .with_rpc_scope(scope)
                .with_http_port(*http_port);
            Decision::go(Action::Migrate { config }).warn(warning)
        }

        Intent::Backup { include_data } => Decision::go(Action::Backup {
            include_data: *include_data,
        }),

        Intent::Restore {
            snapshot,
            restore_data,
        } => Decision::go(Action::Restore {
            snapshot: *snapshot,
            restore_data: *restore_data,
        }),

        Intent::RegenerateIdentity => Decision::go(Action::RegenerateIdentity),

        Intent::Cancel => Decision::go(Action::Cancel),
    }
}

fn plan_upgrade(
    state: &HostState,
    version: Option<String>,
    layout: &NodeLayout,
    offered: Vec<ActionKind>,
) -> Decision {
    if !state.phase.is_managed() {
        return Decision::go(Action::Upgrade {
            config: None,
            version,
        })
        .warn(Some(
            "deployment is unmanaged: only the binary is replaced; config and service definition stay as they are"
                .to_string(),
        ));
    }

    if let Some(record) = &state.record {
        return Decision::go(Action::Upgrade {
            config: Some(record.to_config(layout)),
            version,
        });
    }

    // managed unit but no deployment record: rebuild from what node.json says
    let Some(observed) = &state.observed else {
        return Decision::refuse(
            "managed deployment has neither a deployment record nor a readable node config",
            offered,
        );
    };
    let Some(network) = observed.network else {
        return Decision::refuse(
            "managed deployment's node config does not name a network",
            offered,
        );
    };
    let role = observed.role();
    let config = NodeConfig::for_role(role, network, layout)
        .with_rpc_scope(observed.rpc_scope)
        .with_http_port(observed.http_port.unwrap_or(DEFAULT_HTTP_PORT));
    Decision::go(Action::Upgrade {
        config: Some(config),
        version,
    })
    .warn(Some(format!(
        "deployment record missing; regenerating config as role {} from node.json",
        role
    )))
}
