//! Run orchestration.
//!
//! One run walks `Scanning -> Diffing -> (ShortCircuit | Dispatching) ->
//! Aggregating -> Committing`. The change cache decides what runs, the
//! worker pool decides how many run at once, and the caches are written by
//! this module only, after every task has joined.

use crate::agents::{AgentFactory, AgentInput, AnalyzerFactory};
use crate::cache::{ChangeCache, ChangeReport, FileRecord, ResponseCache};
use crate::config::{AtlasConfig, RunOptions};
use crate::error::{RunError, TaskError};
use crate::llm::{self, Usage};
use crate::pool::{task, Task, TaskResult, WorkerPool};
use crate::scan::{FileScanner, ScanMetrics, ScanOptions};
use crate::util::normalize_rel_path;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scanning,
    Diffing,
    ShortCircuit,
    Dispatching,
    Aggregating,
    Committing,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Scanning => "scanning",
            Phase::Diffing => "diffing",
            Phase::ShortCircuit => "short-circuit",
            Phase::Dispatching => "dispatching",
            Phase::Aggregating => "aggregating",
            Phase::Committing => "committing",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Everything one repository's runs need, wired once.
pub struct RunContext {
    pub root: PathBuf,
    pub config: AtlasConfig,
    pub change_cache: ChangeCache,
    pub response_cache: Arc<ResponseCache>,
    pub factory: Arc<dyn AgentFactory>,
    /// Shared by every task; cancelling it stops pending agents.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Standard wiring: load both caches, build the invoker stack and the
    /// built-in analyzers.
    pub fn open(root: &Path, config: AtlasConfig) -> anyhow::Result<Self> {
        let response_cache = Arc::new(ResponseCache::load(root, &config.cache));
        let invoker = llm::build_invoker(&config.llm, response_cache.clone())?;
        let factory = Arc::new(AnalyzerFactory::new(invoker, config.clone()));
        Ok(Self::new(root, config, factory, response_cache))
    }

    pub fn new(
        root: &Path,
        config: AtlasConfig,
        factory: Arc<dyn AgentFactory>,
        response_cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            change_cache: ChangeCache::load(root),
            config,
            response_cache,
            factory,
            cancel: CancellationToken::new(),
        }
    }

    /// Directory agent reports are written to.
    pub fn output_dir(&self) -> PathBuf {
        if self.config.run.output_dir.is_absolute() {
            self.config.run.output_dir.clone()
        } else {
            self.root.join(&self.config.run.output_dir)
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub agent: String,
    pub error: String,
    /// Stopped by the shared cancellation token rather than by its own error.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    /// No dispatched agent failed.
    Success,
    /// Some dispatched agents failed, others succeeded or were still valid.
    PartialSuccess,
    /// Every dispatched agent failed and none were skip-eligible.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Agents that ran and succeeded in this run; on a short-circuit, the
    /// agents whose previous outputs are still valid.
    pub successful: Vec<String>,
    pub failed: Vec<AgentFailure>,
    /// Skip-eligible agents that did not need to run.
    pub skipped: Vec<String>,
    pub excluded: Vec<String>,
    pub short_circuited: bool,
    pub forced: bool,
    pub change_report: ChangeReport,
    pub scan_metrics: ScanMetrics,
    pub reports: Vec<PathBuf>,
    pub response_cache_hits: u64,
    pub response_cache_misses: u64,
    pub usage: Usage,
}

impl RunReport {
    pub fn verdict(&self) -> RunVerdict {
        if self.failed.is_empty() {
            RunVerdict::Success
        } else if self.successful.is_empty() && self.skipped.is_empty() {
            RunVerdict::Fatal
        } else {
            RunVerdict::PartialSuccess
        }
    }
}

/// Value returned by one successful agent task.
#[derive(Debug)]
struct AgentRun {
    report_path: PathBuf,
    cached: bool,
    usage: Option<Usage>,
}

pub struct Orchestrator {
    ctx: RunContext,
}

impl Orchestrator {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Execute one analysis run. Only the all-agents-failed outcome is an
    /// error; scan, cache, and individual agent failures are reported in the
    /// [`RunReport`].
    pub async fn run(&mut self, options: &RunOptions) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = self.ctx.config.clone().with_options(options);
        let excluded = &config.run.excluded_agents;

        let all_agents = self.ctx.factory.names();
        let agents: Vec<String> = all_agents
            .iter()
            .filter(|name| !excluded.contains(*name))
            .cloned()
            .collect();
        let excluded_known: Vec<String> = all_agents
            .iter()
            .filter(|name| excluded.contains(*name))
            .cloned()
            .collect();

        tracing::debug!(%run_id, phase = %Phase::Scanning, "run started");
        let (files, scan_metrics) = self.scan(&config).await;

        tracing::debug!(%run_id, phase = %Phase::Diffing, files = files.len());
        let mut change_report = self.ctx.change_cache.detect_changes(&files, &agents);
        if options.force {
            change_report.agents_to_run = agents.iter().cloned().collect();
            change_report.agents_to_skip.clear();
        }

        let stats_before = self.ctx.response_cache.stats();
        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            successful: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            excluded: excluded_known,
            short_circuited: false,
            forced: options.force,
            change_report: ChangeReport::default(),
            scan_metrics,
            reports: Vec::new(),
            response_cache_hits: 0,
            response_cache_misses: 0,
            usage: Usage::default(),
        };

        if change_report.agents_to_run.is_empty() {
            tracing::debug!(%run_id, phase = %Phase::ShortCircuit, "all agents up to date");
            report.short_circuited = true;
            report.successful = ordered(&agents, &change_report.agents_to_skip);
            if change_report.has_changes {
                // Only excluded agents would have run; keep the file map current.
                self.commit(Arc::new(files), BTreeMap::new()).await;
            }
        } else {
            tracing::debug!(
                %run_id,
                phase = %Phase::Dispatching,
                agents = change_report.agents_to_run.len()
            );
            let due = ordered(&agents, &change_report.agents_to_run);
            let files = Arc::new(files);
            let results = self.dispatch(&config, &due, files.clone()).await;

            tracing::debug!(%run_id, phase = %Phase::Aggregating);
            aggregate(&mut report, &due, results);
            report.skipped = ordered(&agents, &change_report.agents_to_skip);

            tracing::debug!(%run_id, phase = %Phase::Committing);
            let mut outcomes: BTreeMap<String, bool> = BTreeMap::new();
            for name in report.successful.iter().chain(report.skipped.iter()) {
                outcomes.insert(name.clone(), true);
            }
            for failure in &report.failed {
                outcomes.insert(failure.agent.clone(), false);
            }
            self.commit(files, outcomes).await;
        }

        let response_cache = self.ctx.response_cache.clone();
        match tokio::task::spawn_blocking(move || response_cache.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to persist response cache"),
            Err(err) => tracing::warn!(error = %err, "response cache save panicked"),
        }
        let stats_after = self.ctx.response_cache.stats();
        report.response_cache_hits = stats_after.hits.saturating_sub(stats_before.hits);
        report.response_cache_misses = stats_after.misses.saturating_sub(stats_before.misses);
        report.change_report = change_report;
        report.finished_at = Utc::now();

        tracing::info!(
            %run_id,
            phase = %Phase::Done,
            successful = report.successful.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            short_circuited = report.short_circuited,
            "run finished"
        );

        if report.verdict() == RunVerdict::Fatal {
            return Err(RunError::AllAgentsFailed {
                failed: report
                    .failed
                    .iter()
                    .map(|f| (f.agent.clone(), f.error.clone()))
                    .collect(),
            });
        }
        Ok(report)
    }

    async fn scan(&self, config: &AtlasConfig) -> (BTreeMap<String, FileRecord>, ScanMetrics) {
        let output_dir = self.ctx.output_dir();
        let excluded_dirs = match output_dir.strip_prefix(&self.ctx.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => {
                vec![normalize_rel_path(&output_dir, &self.ctx.root)]
            }
            _ => Vec::new(),
        };
        let options = ScanOptions {
            ignore_patterns: config.run.ignore_patterns.clone(),
            excluded_dirs,
            max_hash_workers: config.run.max_hash_workers,
            max_file_bytes: config.run.max_file_bytes,
        };
        let scanner = match FileScanner::new(options) {
            Ok(scanner) => scanner,
            Err(err) => {
                tracing::warn!(error = %err, "scan failed; treating the repository as unknown");
                return (BTreeMap::new(), ScanMetrics::default());
            }
        };

        let root = self.ctx.root.clone();
        let previous = self.ctx.change_cache.snapshot().files.clone();
        let joined =
            tokio::task::spawn_blocking(move || scanner.scan(&root, Some(&previous))).await;
        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "scan failed; treating the repository as unknown");
                (BTreeMap::new(), ScanMetrics::default())
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "scan task panicked; treating the repository as unknown"
                );
                (BTreeMap::new(), ScanMetrics::default())
            }
        }
    }

    async fn dispatch(
        &self,
        config: &AtlasConfig,
        due: &[String],
        files: Arc<BTreeMap<String, FileRecord>>,
    ) -> Vec<TaskResult<AgentRun>> {
        let input = AgentInput {
            root: self.ctx.root.clone(),
            files,
        };
        let output_dir = self.ctx.output_dir();

        let tasks: Vec<Task<AgentRun>> = due
            .iter()
            .map(|name| {
                let name = name.clone();
                let factory = self.ctx.factory.clone();
                let input = input.clone();
                let report_path = output_dir.join(format!("{}.md", name));
                task(move |cancel: CancellationToken| async move {
                    let agent = factory.build(&name, &input)?;
                    let output = agent.run(&cancel).await?;
                    agent.save_output(&output, &report_path)?;
                    Ok(AgentRun {
                        report_path,
                        cached: output.cached,
                        usage: output.usage,
                    })
                })
            })
            .collect();

        WorkerPool::new(config.run.max_workers)
            .run(&self.ctx.cancel, tasks)
            .await
    }

    /// Commit on the blocking pool; the cache lock may wait for another
    /// process.
    async fn commit(
        &mut self,
        files: Arc<BTreeMap<String, FileRecord>>,
        outcomes: BTreeMap<String, bool>,
    ) {
        let root = self.ctx.root.clone();
        let mut cache = std::mem::replace(&mut self.ctx.change_cache, ChangeCache::empty(&root));
        let joined = tokio::task::spawn_blocking(move || {
            let result = cache.commit(&files, &outcomes);
            (cache, result)
        })
        .await;
        match joined {
            Ok((cache, result)) => {
                self.ctx.change_cache = cache;
                if let Err(err) = result {
                    tracing::warn!(
                        error = %err,
                        "failed to commit change cache; next run will redo work"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "change cache commit panicked; reloading from disk");
                self.ctx.change_cache = ChangeCache::load(&root);
            }
        }
    }
}

/// `names` in dispatch order, restricted to `set`.
fn ordered(names: &[String], set: &BTreeSet<String>) -> Vec<String> {
    names.iter().filter(|n| set.contains(*n)).cloned().collect()
}

fn aggregate(report: &mut RunReport, due: &[String], results: Vec<TaskResult<AgentRun>>) {
    for (name, result) in due.iter().zip(results) {
        match result {
            Ok(run) => {
                if let Some(usage) = run.usage {
                    report.usage.prompt_tokens += usage.prompt_tokens;
                    report.usage.completion_tokens += usage.completion_tokens;
                    report.usage.total_tokens += usage.total_tokens;
                }
                tracing::debug!(agent = %name, cached = run.cached, "agent succeeded");
                report.successful.push(name.clone());
                report.reports.push(run.report_path);
            }
            Err(err) => {
                let cancelled = err.is_cancelled();
                let error = match &err {
                    TaskError::Failed(inner) => format!("{:#}", inner),
                    other => other.to_string(),
                };
                tracing::warn!(agent = %name, cancelled, error = %error, "agent failed");
                report.failed.push(AgentFailure {
                    agent: name.clone(),
                    error,
                    cancelled,
                });
            }
        }
    }
}
