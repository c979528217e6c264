use std::path::PathBuf;

use avanode_backup::{RestoreStep, SnapshotId};
use avanode_store::{Network, Role, RpcScope};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "avanode")]
#[command(version, about = "Install and operate an AvalancheGo node under systemd", long_about = None)]
pub struct Cli {
    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Settings file (default /etc/avanode/avanode.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Node root directory, overriding settings
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Install a new node on an empty host
    Install {
        /// validator, archival or api
        #[arg(long)]
        role: Role,

        /// mainnet, testnet or local
        #[arg(long)]
        network: Network,

        /// loopback or public
        #[arg(long, default_value = "loopback")]
        rpc: RpcScope,

        /// Allow public RPC on a validator
        #[arg(long)]
        confirm_public_rpc: bool,

        #[arg(long)]
        http_port: Option<u16>,

        /// Release tag to install (default: latest)
        #[arg(long, value_name = "TAG")]
        release: Option<String>,
    },

    /// Replace the node binary and restart
    Upgrade {
        #[arg(long, value_name = "TAG")]
        release: Option<String>,
    },

    /// Bring an existing hand-made deployment under management
    Migrate {
        #[arg(long)]
        role: Role,

        /// Defaults to the network in the existing config
        #[arg(long)]
        network: Option<Network>,

        /// Defaults to the scope in the existing config
        #[arg(long)]
        rpc: Option<RpcScope>,

        #[arg(long)]
        confirm_public_rpc: bool,

        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Snapshot identity and config
    Backup {
        /// Archive the data directory too (stops the service while archiving)
        #[arg(long)]
        include_data: bool,
    },

    /// Put a snapshot's identity and config back in place
    Restore {
        #[arg(long, value_name = "ID")]
        snapshot: SnapshotId,

        /// Replace the data directory from the snapshot's archive
        #[arg(long)]
        restore_data: bool,

        /// Rehearse the rollback path by failing at this step
        #[arg(long, value_name = "STEP")]
        fail_at: Option<RestoreStep>,
    },

    /// Show host, service and node state
    Status,

    /// List snapshots, newest first
    Snapshots,

    /// Re-check a snapshot against its manifest
    Verify {
        #[arg(long, value_name = "ID")]
        snapshot: SnapshotId,
    },

    /// Delete all but the newest snapshots
    Prune {
        /// How many to keep (default from settings)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        keep: Option<u64>,
    },

    /// Print the last service log lines
    Logs {
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },

    /// Replace the node identity with a new one (changes the NodeID)
    RegenerateIdentity,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Install { .. } => "install",
            Command::Upgrade { .. } => "upgrade",
            Command::Migrate { .. } => "migrate",
            Command::Backup { .. } => "backup",
            Command::Restore { .. } => "restore",
            Command::Status => "status",
            Command::Snapshots => "snapshots",
            Command::Verify { .. } => "verify",
            Command::Prune { .. } => "prune",
            Command::Logs { .. } => "logs",
            Command::RegenerateIdentity => "regenerate-identity",
        }
    }

    /// Commands that change the host and need preflight plus the lock
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Install { .. }
                | Command::Upgrade { .. }
                | Command::Migrate { .. }
                | Command::Backup { .. }
                | Command::Restore { .. }
                | Command::RegenerateIdentity
        )
    }

    /// Commands allowed to create the service account
    pub fn creates_account(&self) -> bool {
        matches!(self, Command::Install { .. } | Command::Migrate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install() {
        let cli = Cli::try_parse_from([
            "avanode", "--yes", "install", "--role", "validator", "--network", "testnet",
        ])
        .unwrap();
        assert!(cli.yes);
        assert_eq!(
            cli.command,
            Command::Install {
                role: Role::Validator,
                network: Network::Testnet,
                rpc: RpcScope::Loopback,
                confirm_public_rpc: false,
                http_port: None,
                release: None,
            }
        );
        assert!(cli.command.mutates());
        assert!(cli.command.creates_account());
    }

    #[test]
    fn test_parse_restore_drill() {
        let cli = Cli::try_parse_from([
            "avanode",
            "restore",
            "--snapshot",
            "20261018T142233Z-1",
            "--fail-at",
            "replace",
            "--root",
            "/srv/avalanchego",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/srv/avalanchego")));
        match cli.command {
            Command::Restore {
                snapshot, fail_at, ..
            } => {
                assert_eq!(snapshot.to_string(), "20261018T142233Z-1");
                assert_eq!(fail_at, Some(RestoreStep::Replace));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Cli::try_parse_from(["avanode", "install", "--role", "miner", "--network", "mainnet"]).is_err());
        assert!(Cli::try_parse_from(["avanode", "restore", "--snapshot", "yesterday"]).is_err());
        assert!(Cli::try_parse_from(["avanode", "prune", "--keep", "0"]).is_err());
    }

    #[test]
    fn test_read_only_commands() {
        let cli = Cli::try_parse_from(["avanode", "logs", "-n", "20"]).unwrap();
        assert_eq!(cli.command, Command::Logs { lines: 20 });
        assert!(!cli.command.mutates());
        assert_eq!(Command::RegenerateIdentity.name(), "regenerate-identity");
    }
}
