//! atlas - incremental codebase reports
//!
//! Scans a repository, reruns only the analysis agents whose inputs
//! changed, and writes one Markdown report per agent.

use anyhow::Result;
use clap::Parser;
use repo_atlas::cache::{Cache, ResetOption};
use repo_atlas::config::{AtlasConfig, RunOptions};
use repo_atlas::{Orchestrator, RunContext, RunError, RunReport, RunVerdict};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "atlas",
    about = "Incremental LLM-generated reports for a codebase",
    long_about = "Scans the repository, reruns only the analysis agents whose inputs\n\
                  changed since the last run, and writes one Markdown report per agent\n\
                  (structure, dependencies, data_flow, request_flow, api_surface).",
    version
)]
struct Args {
    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Rerun every agent even if its inputs are unchanged
    #[arg(short, long)]
    force: bool,

    /// Skip an agent by name (repeatable)
    #[arg(short = 'x', long = "exclude", value_name = "NAME")]
    exclude: Vec<String>,

    /// Concurrent agents (0 = available parallelism)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Concurrent file hashing threads (0 = available parallelism)
    #[arg(long)]
    hash_workers: Option<usize>,

    /// Delete cached state and reports, then exit
    #[arg(long)]
    reset: bool,

    /// Debug logging (overrides ATLAS_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let path = args.path.canonicalize()?;
    let config = AtlasConfig::load(&path);

    if args.reset {
        let reports_dir = path.join(&config.run.output_dir);
        let cleared = Cache::new(&path).clear_selective(&ResetOption::all(), &reports_dir)?;
        if cleared.is_empty() {
            eprintln!("  Nothing to reset");
        } else {
            eprintln!("  Cleared: {}", cleared.join(", "));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let options = RunOptions {
        force: args.force,
        excluded_agents: args.exclude.into_iter().collect(),
        max_workers: args.workers,
        max_hash_workers: args.hash_workers,
    };

    let mut orchestrator = Orchestrator::new(RunContext::open(&path, config)?);
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Cancelling pending agents...");
            cancel.cancel();
        }
    });

    match orchestrator.run(&options).await {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(RunError::AllAgentsFailed { failed }) => {
            eprintln!("  All agents failed:");
            for (agent, error) in failed {
                eprintln!("    - {}: {}", agent, error);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("repo_atlas=debug,atlas=debug")
    } else {
        EnvFilter::try_from_env("ATLAS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_report(report: &RunReport) {
    let metrics = &report.scan_metrics;
    eprintln!(
        "  Scanned {} files ({} reused, {:.0}%; {} hashed, {} binary, {} too large)",
        metrics.total_files,
        metrics.cached_files,
        metrics.reuse_ratio() * 100.0,
        metrics.hashed_files,
        metrics.skipped_binary,
        metrics.skipped_large
    );
    if metrics.failed_files > 0 {
        eprintln!("  Could not read {} files", metrics.failed_files);
        for failure in metrics.errors.iter().take(3) {
            eprintln!("    - {}: {}", failure.path, failure.message);
        }
        if metrics.failed_files > 3 {
            eprintln!("    ({} more)", metrics.failed_files - 3);
        }
    }

    let changes = &report.change_report;
    if report.forced {
        eprintln!("  Forced run");
    } else if changes.has_changes {
        eprintln!(
            "  Changes: {} added, {} modified, {} deleted",
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len()
        );
    }

    if report.short_circuited {
        eprintln!("  Everything up to date; no agents ran");
    }
    if !report.successful.is_empty() {
        let label = if report.short_circuited { "Still valid" } else { "Succeeded" };
        eprintln!("  {}: {}", label, report.successful.join(", "));
    }
    if !report.skipped.is_empty() {
        eprintln!("  Skipped (unchanged): {}", report.skipped.join(", "));
    }
    if !report.excluded.is_empty() {
        eprintln!("  Excluded: {}", report.excluded.join(", "));
    }
    for failure in &report.failed {
        let kind = if failure.cancelled { "cancelled" } else { "failed" };
        eprintln!("  ! {} {}: {}", failure.agent, kind, failure.error);
    }

    if report.response_cache_hits + report.response_cache_misses > 0 {
        eprintln!(
            "  Response cache: {} hits, {} misses",
            report.response_cache_hits, report.response_cache_misses
        );
    }
    if report.usage.total_tokens > 0 {
        eprintln!("  Tokens: {}", report.usage.total_tokens);
    }
    for path in &report.reports {
        println!("{}", path.display());
    }

    if report.verdict() == RunVerdict::PartialSuccess {
        eprintln!("  Partial success: see failures above");
    }
}
