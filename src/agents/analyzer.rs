use super::{Agent, AgentInput, AgentKind, AgentOutput};
use crate::cache::{write_atomic, FileRecord};
use crate::config::AgentConfig;
use crate::error::InvokeError;
use crate::llm::{ChatMessage, CompletionRequest, Invoker};
use crate::util::{resolve_rel_path, truncate_bytes};
use anyhow::Context;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_LISTED_FILES: usize = 1_500;
/// Stop adding file contents once less than this much budget is left.
const MIN_SNIPPET_BYTES: usize = 256;

/// One analyzer family bound to a run's input and model settings.
pub struct AnalyzerAgent {
    kind: AgentKind,
    input: AgentInput,
    model: String,
    config: AgentConfig,
    invoker: Arc<dyn Invoker>,
}

impl AnalyzerAgent {
    pub fn new(
        kind: AgentKind,
        input: AgentInput,
        model: String,
        config: AgentConfig,
        invoker: Arc<dyn Invoker>,
    ) -> Self {
        Self {
            kind,
            input,
            model,
            config,
            invoker,
        }
    }
}

impl Agent for AnalyzerAgent {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn run<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<AgentOutput>> {
        Box::pin(async move {
            let kind = self.kind;
            let root = self.input.root.clone();
            let files = self.input.files.clone();
            let budget = self.config.max_context_bytes;
            let (context, files_included) =
                tokio::task::spawn_blocking(move || build_context(kind, &root, &files, budget))
                    .await
                    .context("context assembly panicked")?;

            if cancel.is_cancelled() {
                return Err(anyhow::Error::new(InvokeError::Cancelled));
            }

            let request = CompletionRequest::new(self.model.clone(), kind.system_prompt())
                .with_message(ChatMessage::user(context))
                .with_temperature(self.config.temperature)
                .with_max_tokens(self.config.max_tokens);

            let response = self
                .invoker
                .complete(&request, cancel)
                .await
                .with_context(|| format!("{} agent: model request failed", kind))?;

            tracing::debug!(
                agent = %kind,
                cached = response.cached,
                files = files_included,
                "agent finished"
            );

            Ok(AgentOutput {
                agent: kind.name().to_string(),
                title: kind.title().to_string(),
                content: response.content,
                model: self.model.clone(),
                files_considered: self.input.files.len(),
                files_included,
                cached: response.cached,
                usage: response.usage,
                generated_at: Utc::now(),
            })
        })
    }

    fn save_output(&self, output: &AgentOutput, path: &Path) -> anyhow::Result<()> {
        write_atomic(path, &output.to_markdown())
            .with_context(|| format!("failed to save {} report", self.kind))?;
        Ok(())
    }
}

/// Prompt body for `kind`: the full file listing, then the contents of the
/// relevant files in path order until `max_bytes` is spent. Returns the
/// text and the number of files whose contents were included.
///
/// Output only depends on the file map and file contents, so identical
/// repositories produce identical prompts (and response cache hits).
pub fn build_context(
    kind: AgentKind,
    root: &Path,
    files: &BTreeMap<String, FileRecord>,
    max_bytes: usize,
) -> (String, usize) {
    let mut out = String::new();
    out.push_str(&format!("## Files ({})\n\n", files.len()));
    for path in files.keys().take(MAX_LISTED_FILES) {
        out.push_str(path);
        out.push('\n');
    }
    if files.len() > MAX_LISTED_FILES {
        out.push_str(&format!("... and {} more\n", files.len() - MAX_LISTED_FILES));
    }

    let mut remaining = max_bytes;
    let mut included = 0;
    let mut relevant_section = String::new();
    for path in files.keys().filter(|path| kind.is_relevant(path)) {
        if remaining < MIN_SNIPPET_BYTES {
            break;
        }
        let content = match fs::read_to_string(resolve_rel_path(root, path)) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!(
                    agent = %kind,
                    path = %path,
                    error = %err,
                    "skipping unreadable file"
                );
                continue;
            }
        };
        let snippet = truncate_bytes(&content, remaining);
        remaining -= snippet.len();
        included += 1;

        relevant_section.push_str(&format!("### {}\n```\n{}\n```\n\n", path, snippet));
        if snippet.len() < content.len() {
            relevant_section.push_str("(truncated)\n\n");
        }
    }

    if included > 0 {
        out.push_str("\n## Relevant files\n\n");
        out.push_str(&relevant_section);
    }
    (out, included)
}
