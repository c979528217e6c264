// COMMAND DISPATCH
//
// SAFETY INVARIANTS:
// 1. Mutating commands pass host preflight before the driver is built
// 2. Every exit code comes from a FailureClass; success is 0
// 3. Every run prints its final state, and on failure any snapshot it left behind

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use avanode_backup::{FaultPlan, SnapshotId};
use avanode_reconciler::{
    preflight_check, service_owner, AssumeYes, Driver, DriverError, DriverSettings, FinalState,
    Intent, PreflightPolicy, Prompter, ReleaseInstaller, RpcProbe, RpcRequest, TerminalPrompter,
};
use avanode_store::{read_deployment_record, NodeLayout};
use avanode_supervisor::SystemdSupervisor;
use tracing::{debug, warn};

use crate::cli::{Cli, Command};
use crate::settings::Settings;

/// Timeout of a single node RPC call
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Translate a mutating command into an intent for the reconciler.
pub fn intent_for(command: &Command, settings: &Settings) -> Option<Intent> {
    let intent = match command {
        Command::Install {
            role,
            network,
            rpc,
            confirm_public_rpc,
            http_port,
            release,
        } => Intent::Install {
            role: *role,
            network: *network,
            rpc: RpcRequest {
                scope: *rpc,
                confirm_public: *confirm_public_rpc,
            },
            http_port: http_port.unwrap_or(settings.http_port),
            version: release.clone(),
        },
        Command::Upgrade { release } => Intent::Upgrade {
            version: release.clone(),
        },
        Command::Migrate {
            role,
            network,
            rpc,
            confirm_public_rpc,
            http_port,
        } => Intent::Migrate {
            role: *role,
            network: *network,
            rpc: rpc.map(|scope| RpcRequest {
                scope,
                confirm_public: *confirm_public_rpc,
            }),
            http_port: http_port.unwrap_or(settings.http_port),
        },
        Command::Backup { include_data } => Intent::Backup {
            include_data: *include_data,
        },
        Command::Restore {
            snapshot,
            restore_data,
            ..
        } => Intent::Restore {
            snapshot: *snapshot,
            restore_data: *restore_data,
        },
        Command::RegenerateIdentity => Intent::RegenerateIdentity,
        Command::Status
        | Command::Snapshots
        | Command::Verify { .. }
        | Command::Prune { .. }
        | Command::Logs { .. } => return None,
    };
    Some(intent)
}

/// Port the node's HTTP API listens on for this command.
pub fn probe_port(command: &Command, settings: &Settings, layout: &NodeLayout) -> u16 {
    let requested = match command {
        Command::Install { http_port, .. } | Command::Migrate { http_port, .. } => *http_port,
        _ => None,
    };
    requested
        .or_else(|| {
            read_deployment_record(layout)
                .ok()
                .flatten()
                .map(|record| record.http_port)
        })
        .unwrap_or(settings.http_port)
}

async fn build_driver(cli: &Cli, settings: &Settings) -> Result<Driver, DriverError> {
    let layout = settings.layout();
    let owner = if cli.command.mutates() {
        Some(service_owner(&settings.service_user, cli.command.creates_account()).await?)
    } else {
        None
    };

    let supervisor = SystemdSupervisor::new(settings.service_name.as_str())
        .with_stop_timeout(settings.stop_timeout());
    let installer = ReleaseInstaller::new(
        &settings.install_dir,
        settings.fetch_timeout(),
        settings.retry_policy(),
    )?
    .with_base_url(settings.release_base_url.as_str())
    .with_latest_url(settings.latest_release_url.as_str());
    let probe = RpcProbe::local(
        probe_port(&cli.command, settings, &layout),
        PROBE_REQUEST_TIMEOUT,
    )?;
    let prompter: Arc<dyn Prompter> = if cli.yes {
        Arc::new(AssumeYes)
    } else {
        Arc::new(TerminalPrompter)
    };

    let driver_settings = DriverSettings {
        service_user: settings.service_user.clone(),
        owner,
        settle: settings.settle(),
        rpc_timeout: settings.rpc_timeout(),
        archive_timeout: settings.archive_timeout(),
        log_tail_lines: settings.log_tail_lines as usize,
        ..DriverSettings::default()
    };

    let mut driver = Driver::new(
        layout,
        Arc::new(supervisor),
        Arc::new(installer),
        Arc::new(probe),
        prompter,
        driver_settings,
    );
    if let Command::Restore {
        fail_at: Some(step),
        ..
    } = &cli.command
    {
        warn!("Restore drill: failing deliberately at {}", step);
        driver = driver.with_faults(FaultPlan::fail_at(*step));
    }
    Ok(driver)
}

/// Run one parsed command and return the process exit code.
pub async fn execute(cli: &Cli, settings: &Settings) -> i32 {
    let name = cli.command.name();

    if cli.command.mutates() {
        match preflight_check(&PreflightPolicy::default()).into_result() {
            Ok(warnings) => debug!("Preflight passed with {} warning(s)", warnings.len()),
            Err(e) => return fail(name, &e, &[]),
        }
    }

    let driver = match build_driver(cli, settings).await {
        Ok(driver) => driver,
        Err(e) => return fail(name, &e, &[]),
    };

    match intent_for(&cli.command, settings) {
        Some(intent) => run_intent(&driver, name, intent).await,
        None => match inspect(&driver, &cli.command, settings).await {
            Ok(()) => 0,
            Err(e) => fail(name, &e, &[]),
        },
    }
}

async fn run_intent(driver: &Driver, name: &str, intent: Intent) -> i32 {
    let before = driver.engine().list_ids().unwrap_or_default();
    match driver.execute(intent).await {
        Ok(report) => {
            print!("{}", report);
            0
        }
        Err(e) => {
            let left = new_snapshots(driver, &before);
            fail(name, &e, &left)
        }
    }
}

/// Snapshots committed since `before` was listed
fn new_snapshots(driver: &Driver, before: &[SnapshotId]) -> Vec<PathBuf> {
    let backups = driver.layout().backups_dir();
    driver
        .engine()
        .list_ids()
        .unwrap_or_default()
        .into_iter()
        .filter(|id| !before.contains(id))
        .map(|id| backups.join(id.to_string()))
        .collect()
}

fn fail(name: &str, error: &DriverError, snapshots: &[PathBuf]) -> i32 {
    let class = error.class();
    eprintln!("{}: {}", name, FinalState::from_class(class));
    eprintln!("  error:    {}", error);
    for snapshot in snapshots {
        eprintln!("  snapshot: {}", snapshot.display());
    }
    eprintln!("  ({}, exit {})", class, class.exit_code());
    class.exit_code()
}

async fn inspect(driver: &Driver, command: &Command, settings: &Settings) -> Result<(), DriverError> {
    match command {
        Command::Status => print!("{}", driver.status().await?),
        Command::Snapshots => {
            let snapshots = driver.snapshots()?;
            if snapshots.is_empty() {
                println!("no snapshots in {}", driver.layout().backups_dir().display());
            }
            for snapshot in snapshots {
                println!(
                    "{:<22} {:<15} {} {:>3} files{}  {}",
                    snapshot.id.to_string(),
                    snapshot.manifest.reason.to_string(),
                    snapshot.manifest.created_at.to_rfc3339(),
                    snapshot.manifest.file_count,
                    if snapshot.includes_data() { " +data" } else { "" },
                    snapshot.path.display()
                );
            }
        }
        Command::Verify { snapshot } => {
            let (snapshot, report) = driver.verify_snapshot(snapshot).await?;
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            for violation in &report.violations {
                println!("violation: {}", violation);
            }
            if !report.is_clean() {
                return Err(DriverError::Verification(format!(
                    "snapshot {} failed verification ({} problem(s))",
                    snapshot.id,
                    report.violations.len()
                )));
            }
            println!("snapshot {} verified at {}", snapshot.id, snapshot.path.display());
        }
        Command::Prune { keep } => {
            let keep = keep.unwrap_or(settings.keep_snapshots) as usize;
            let removed = driver.prune(keep).await?;
            if removed.is_empty() {
                println!("nothing to prune (keeping {})", keep);
            }
            for id in removed {
                println!("removed {}", id);
            }
        }
        Command::Logs { lines } => {
            for line in driver.logs(*lines).await? {
                println!("{}", line);
            }
        }
        other => {
            return Err(DriverError::Precondition(format!(
                "{} is not a read-only command",
                other.name()
            )))
        }
    }
    Ok(())
}
