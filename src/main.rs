//! credguard - credential self-check engine
//!
//! CLI entry point.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use clap::Parser;
use std::process::ExitCode;

use credguard::cli::{Cli, Commands};
use credguard::core::logging;
use credguard::storage::config::ResolvedConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let daemon = matches!(&cli.command, Commands::Run(args) if !args.once);
    let log_settings = logging::LogSettings::resolve(
        cli.log_level.as_deref(),
        cli.json_output,
        cli.verbose,
        daemon,
    );

    // The config file may set the level; it only applies when CLI and env are silent.
    let resolved = ResolvedConfig::resolve(&cli, run_args(&cli));
    match &resolved {
        Ok(resolved) => log_settings.with_level(resolved.log_level).init(),
        Err(_) => log_settings.init(),
    }

    let result = match resolved {
        Ok(resolved) => run(&cli, &resolved).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error_code = e.error_code(), "{e}");
            eprintln!("Error [{}]: {e}", e.error_code());
            if let Some(action) = e.required_action() {
                eprintln!("Action: {action}");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run_args(cli: &Cli) -> Option<&credguard::cli::RunArgs> {
    match &cli.command {
        Commands::Run(args) => Some(args),
        _ => None,
    }
}

async fn run(cli: &Cli, resolved: &ResolvedConfig) -> credguard::Result<()> {
    let format = cli.effective_format();
    let pretty = cli.pretty;

    match &cli.command {
        Commands::Run(args) => credguard::cli::run::execute(resolved, args, format, pretty).await,
        Commands::Validate(args) => {
            credguard::cli::validate::execute(resolved, args, format, pretty).await
        }
        Commands::Config => credguard::cli::config::execute(resolved, format, pretty),
    }
}
