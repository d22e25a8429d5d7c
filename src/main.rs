mod cli;
mod commands;
mod engine;
mod metrics;
mod model;
mod runstate;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

/// Exit code for advisory drift (soft rules only).
pub const EXIT_GATE_WARN: i32 = 10;
/// Exit code for a blocking regression (any hard rule).
pub const EXIT_GATE_FAIL: i32 = 20;

fn main() {
    init_tracing();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %err, "command failed");
            for cause in err.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Capture(args) => {
            commands::capture::run(args)?;
            Ok(0)
        }
        Commands::Compare(args) => commands::compare::run(args),
        Commands::Status(args) => {
            commands::status::run(args)?;
            Ok(0)
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
