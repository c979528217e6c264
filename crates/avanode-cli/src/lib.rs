// === Command line ===
pub mod cli;
pub mod commands;

// === Ambient setup ===
pub mod logging;
pub mod settings;

pub use cli::{Cli, Command};
pub use settings::Settings;

use avanode_reconciler::FailureClass;
use clap::Parser;
use tracing::debug;

/// Parse arguments, load settings, run the command; returns the exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    run_with(cli).await
}

pub async fn run_with(cli: Cli) -> i32 {
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{:#}", e);
    }

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}: failed\n  error:    {:#}", cli.command.name(), e);
            return FailureClass::UserInput.exit_code();
        }
    };
    if let Some(root) = &cli.root {
        settings.root = root.clone();
    }
    debug!("Settings: {:?}", settings);

    commands::execute(&cli, &settings).await
}
