//! Analysis agents.
//!
//! The orchestrator only sees the [`Agent`] capability and builds agents by
//! name through an [`AgentFactory`]. How an agent assembles its prompt or
//! whether its model call is served from the response cache is private to
//! the agent and its invoker.

mod analyzer;
mod kind;

pub use analyzer::{build_context, AnalyzerAgent};
pub use kind::AgentKind;

use crate::cache::FileRecord;
use crate::config::AtlasConfig;
use crate::llm::{Invoker, Usage};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<AgentOutput>>;

    /// Persist `output` at `path`. Must not leave a partial file behind.
    fn save_output(&self, output: &AgentOutput, path: &Path) -> anyhow::Result<()>;
}

/// What an agent produced in one run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub agent: String,
    pub title: String,
    pub content: String,
    pub model: String,
    /// Files in the scan when the agent ran.
    pub files_considered: usize,
    /// Files whose contents made it into the prompt.
    pub files_included: usize,
    /// Served from the response cache.
    pub cached: bool,
    pub usage: Option<Usage>,
    pub generated_at: DateTime<Utc>,
}

impl AgentOutput {
    pub fn to_markdown(&self) -> String {
        let source = if self.cached { ", cached" } else { "" };
        format!(
            "# {}\n\n_Generated {} by `{}` from {} files ({} read in full{})._\n\n{}\n",
            self.title,
            self.generated_at.format("%Y-%m-%d %H:%M UTC"),
            self.model,
            self.files_considered,
            self.files_included,
            source,
            self.content.trim_end()
        )
    }
}

/// Shared, read-only input for every agent in a run.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub root: PathBuf,
    pub files: Arc<BTreeMap<String, FileRecord>>,
}

/// Builds agents by name.
pub trait AgentFactory: Send + Sync {
    /// Every agent this factory can build, in dispatch order.
    fn names(&self) -> Vec<String>;

    fn build(&self, name: &str, input: &AgentInput) -> anyhow::Result<Box<dyn Agent>>;
}

/// Factory for the five built-in analyzers.
pub struct AnalyzerFactory {
    invoker: Arc<dyn Invoker>,
    config: AtlasConfig,
}

impl AnalyzerFactory {
    pub fn new(invoker: Arc<dyn Invoker>, config: AtlasConfig) -> Self {
        Self { invoker, config }
    }
}

impl AgentFactory for AnalyzerFactory {
    fn names(&self) -> Vec<String> {
        AgentKind::ALL.iter().map(|k| k.name().to_string()).collect()
    }

    fn build(&self, name: &str, input: &AgentInput) -> anyhow::Result<Box<dyn Agent>> {
        let kind = AgentKind::from_name(name)
            .ok_or_else(|| anyhow::anyhow!("unknown agent `{}`", name))?;
        Ok(Box::new(AnalyzerAgent::new(
            kind,
            input.clone(),
            self.config.llm.model.clone(),
            self.config.agent(name),
            self.invoker.clone(),
        )))
    }
}
