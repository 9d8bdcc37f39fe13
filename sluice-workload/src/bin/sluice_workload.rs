//! Sluice workload runner.
//!
//! Runs a workload profile against an in-process flow-control pipeline and
//! prints latency, outcome and verification results.
//!
//! # Usage
//!
//! ```bash
//! # Built-in profile
//! sluice-workload --builtin per-client
//!
//! # Profile from a TOML file, more logging
//! sluice-workload --profile stress.toml --log-level debug
//!
//! # Available built-in profiles
//! sluice-workload --list
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sluice_workload::{list_profiles, load_profile, Workload, WorkloadProfile};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sluice workload runner.
#[derive(Parser, Debug)]
#[command(name = "sluice-workload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Profile file (TOML).
    #[arg(long, conflicts_with = "builtin")]
    profile: Option<PathBuf>,

    /// Built-in profile name.
    #[arg(long, default_value = "baseline")]
    builtin: String,

    /// Overrides the profile's random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Lists the built-in profiles and exits.
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn load(args: &Args) -> Result<WorkloadProfile, Box<dyn std::error::Error>> {
    let mut profile = match &args.profile {
        Some(path) => WorkloadProfile::from_file(path)?,
        None => load_profile(&args.builtin)?,
    };
    if let Some(seed) = args.seed {
        profile.execution.seed = seed;
    }
    Ok(profile)
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.list {
        for name in list_profiles() {
            println!("{name}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Logs go to stderr; the summary owns stdout.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = load(&args)?;
    info!(
        profile = %profile.name,
        description = %profile.description,
        seed = profile.execution.seed,
        "loaded workload profile"
    );

    let stats = Workload::new(profile).run()?;
    stats.print_summary();

    if stats.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(violations = stats.violations.len(), "workload found violations");
        Ok(ExitCode::FAILURE)
    }
}
