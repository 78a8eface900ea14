//! Data-quality test suite runner.
//!
//! Reads a JSON run plan, samples each listed table, computes the configured
//! metrics and writes a JSON summary of every test case result.
//!
//! # Guarantees
//! - Sources are only read
//! - Connection strings are redacted in logs and reports
//! - Exit status is non-zero when any test fails or aborts

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use dqprobe_core::{
    BackendRegistry, CancellationFlag, ConnectionType, DefaultConnectionBuilder, LogFormat,
    MetricKind, RunPlan, RunSummary, TestStatus, TestSuiteRunner, init_logging,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dqprobe-run")]
#[command(about = "Data-quality test suite runner")]
#[command(version)]
#[command(long_about = "
dqprobe runner - sample tables and evaluate data-quality test cases

Each table in the run plan is sampled according to its sample settings.
Metrics are pushed down to the source where possible and computed over
the sample otherwise. Every test case ends as Success, Failed or Aborted.

SUPPORTED SOURCES:
- PostgreSQL (postgres://)
- SQLite (sqlite:// or .db/.sqlite files)
- MongoDB (mongodb://)
- Datalake (directory of .json/.jsonl files)

EXAMPLES:
  dqprobe-run run plan.json
  dqprobe-run run plan.json --output report.json --include-sample
  dqprobe-run -v run plan.json --concurrency 4
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every table in a plan file
    Run(RunArgs),
    /// List supported sources and metrics
    List,
}

#[derive(Args)]
struct RunArgs {
    /// Run plan file
    #[arg(help = "Path to a JSON run plan")]
    plan: PathBuf,

    /// Output file path
    #[arg(short, long, help = "Write the JSON summary here instead of stdout")]
    output: Option<PathBuf>,

    #[arg(long, help = "Attach the bounded sample rows to each table report")]
    include_sample: bool,

    #[arg(
        long,
        default_value = "1",
        help = "Number of tables profiled at the same time"
    )]
    concurrency: usize,
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "text",
        env = "DQPROBE_LOG_FORMAT",
        help = "Log line format"
    )]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_format.into())?;

    match &cli.command {
        Command::Run(args) => {
            let cancel = CancellationFlag::new();
            spawn_interrupt_handler(cancel.clone());

            let summary = run_plan_file(args, &cancel).await?;
            write_summary(&summary, args.output.as_deref()).await?;
            Ok(if run_failed(&summary) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::List => {
            list_supported_sources();
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Cancels the run on Ctrl-C; tables already started finish first.
fn spawn_interrupt_handler(cancel: CancellationFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current table and skipping the rest");
            cancel.cancel();
        }
    });
}

async fn run_plan_file(args: &RunArgs, cancel: &CancellationFlag) -> anyhow::Result<RunSummary> {
    let plan = RunPlan::from_path(&args.plan)
        .with_context(|| format!("Failed to load run plan {}", args.plan.display()))?;

    info!(
        "Loaded plan {} with {} table(s)",
        plan.name.as_deref().unwrap_or("<unnamed>"),
        plan.tables.len()
    );

    let registry = Arc::new(BackendRegistry::with_defaults());
    let mut runner = TestSuiteRunner::new(registry, Arc::new(DefaultConnectionBuilder))
        .with_include_sample(args.include_sample);

    let summary = if args.concurrency > 1 {
        runner.run_concurrent(&plan, args.concurrency, cancel).await
    } else {
        runner.run_plan(&plan, cancel).await
    };
    Ok(summary)
}

async fn write_summary(summary: &RunSummary, output: Option<&Path>) -> anyhow::Result<()> {
    let json =
        serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;

    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write summary to {}", path.display()))?;
            info!("Summary written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// True when any test failed or aborted, or any table was not run.
fn run_failed(summary: &RunSummary) -> bool {
    if summary.is_cancelled() {
        warn!("Run cancelled, {} table(s) skipped", summary.skipped.len());
    }
    if summary.has_failures() || summary.is_cancelled() {
        eprintln!(
            "{} passed, {} failed, {} aborted, {} table(s) not run",
            summary.count(TestStatus::Success),
            summary.count(TestStatus::Failed),
            summary.count(TestStatus::Aborted),
            summary.configuration_errors.len() + summary.skipped.len()
        );
        true
    } else {
        false
    }
}

fn source_enabled(connection_type: ConnectionType) -> bool {
    match connection_type {
        ConnectionType::Postgres => cfg!(feature = "postgresql"),
        ConnectionType::Sqlite => cfg!(feature = "sqlite"),
        ConnectionType::MongoDB => cfg!(feature = "mongodb"),
        ConnectionType::Datalake => true,
    }
}

fn list_supported_sources() {
    println!("Supported Sources:");
    println!();

    let registry = BackendRegistry::with_defaults();
    for (category, connection_type) in registry.keys() {
        let status = if source_enabled(connection_type) {
            "enabled"
        } else {
            "not compiled in"
        };
        println!(
            "  {:<10} {:<10} {}",
            category.to_string(),
            connection_type.to_string(),
            status
        );
    }

    println!();
    println!("Metrics:");
    for kind in MetricKind::ALL {
        let scope = if kind.is_table_metric() {
            "table"
        } else {
            "column"
        };
        println!("  {:<16} {}", kind.name(), scope);
    }
}
