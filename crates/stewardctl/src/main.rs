//! stewardctl - runs one OpenVAS maintenance pass
//!
//! Meant to be called from cron. The exit code is the run status:
//! 0 success, 1 warnings, 2 errors or an unusable configuration.

mod output;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use steward::steps::SysinfoDiskProbe;
use steward::{Mailer, Notifier, Orchestrator, ProcessExecutor, ReportStore, SmtpMailer};
use steward_common::{AppConfig, RunMode, SystemClock, CONFIG_PATH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stewardctl")]
#[command(
    about = "OpenVAS/GVM maintenance: health, feeds, cleanup, disk, database, certificates",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Report what would change without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Debug logging on stderr
    #[arg(long, short)]
    verbose: bool,

    /// Never send the alert mail for this run
    #[arg(long)]
    no_email: bool,

    /// Write reports here instead of the configured directory
    #[arg(long)]
    reports_dir: Option<PathBuf>,

    /// Print the JSON report instead of the text summary
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("cannot use configuration {}", cli.config.display()))?;
    debug!("Configuration loaded from {}", cli.config.display());

    let mode = RunMode::from_flags(cli.dry_run, cli.verbose, cli.no_email, &config.maintenance);
    if mode.dry_run {
        info!("Dry-run: no changes will be made");
    }

    let mailer =
        SmtpMailer::from_settings(&config.mail).map(|m| Box::new(m) as Box<dyn Mailer>);
    let orchestrator = Orchestrator::standard(
        Arc::new(ProcessExecutor),
        Arc::new(SystemClock),
        Box::new(SysinfoDiskProbe),
        Notifier::new(mailer, &config.mail),
    );

    let store = ReportStore::new(
        cli.reports_dir
            .clone()
            .unwrap_or_else(|| config.platform.reports_dir.clone()),
    );

    let outcome = orchestrator.run(&config, mode, &store).await?;

    if cli.json {
        output::print_json(&outcome.report)?;
    } else {
        output::print_summary(&outcome, mode);
    }

    Ok(outcome.exit_code())
}

/// Process exit code for a finished run; any fatal error maps to 2
fn exit_code(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            output::print_fatal(&e);
            2
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = exit_code(run(cli).await);
    std::process::exit(code);
}
