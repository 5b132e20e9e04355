//! Configuration for atlas
//!
//! Read from `<repo>/.atlas/config.toml`, falling back to
//! `~/.config/atlas/config.toml`. Every field has a default, so a missing
//! or partial file is fine. A corrupt file is backed up and defaults are
//! used.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AtlasConfig {
    pub run: RunConfig,
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    /// Per-agent overrides keyed by agent name.
    pub agents: BTreeMap<String, AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Concurrent agent tasks. `0` means available parallelism.
    pub max_workers: usize,
    /// Concurrent file hashing threads. `0` means available parallelism.
    pub max_hash_workers: usize,
    pub excluded_agents: BTreeSet<String>,
    /// Extra glob patterns skipped during scanning.
    pub ignore_patterns: Vec<String>,
    /// Where agent reports are written, relative to the repo root.
    pub output_dir: PathBuf,
    /// Files larger than this are not scanned.
    pub max_file_bytes: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            max_hash_workers: 0,
            excluded_agents: BTreeSet::new(),
            ignore_patterns: Vec::new(),
            output_dir: PathBuf::from(".atlas").join("reports"),
            max_file_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1/".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            api_key_env: "ATLAS_API_KEY".to_string(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl LlmConfig {
    /// API key from `api_key_env`, then `ATLAS_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .or_else(|| std::env::var("ATLAS_API_KEY").ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Response cache entries older than this are misses. `0` disables expiry.
    pub response_ttl_hours: i64,
    /// Oldest entries are evicted beyond this count. `0` means unbounded.
    pub max_response_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_hours: 24 * 30,
            max_response_entries: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Budget for file contents included in the prompt.
    pub max_context_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 4_096,
            max_context_bytes: 96 * 1024,
        }
    }
}

/// Run parameters supplied by the CLI, overlaid on the file config.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub excluded_agents: BTreeSet<String>,
    pub max_workers: Option<usize>,
    pub max_hash_workers: Option<usize>,
}

impl AtlasConfig {
    fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("atlas").join(CONFIG_FILE))
    }

    pub fn project_path(root: &Path) -> PathBuf {
        root.join(crate::cache::CACHE_DIR).join(CONFIG_FILE)
    }

    /// Load the project config, then the global one, else defaults.
    pub fn load(root: &Path) -> Self {
        let candidates = std::iter::once(Self::project_path(root)).chain(Self::global_path());
        for path in candidates {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match toml::from_str::<AtlasConfig>(&content) {
                Ok(mut config) => {
                    config.apply_env();
                    return config;
                }
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config file is invalid; a backup was saved and defaults were loaded"
                    );
                }
            }
        }
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("ATLAS_MODEL") {
            if !model.trim().is_empty() {
                self.llm.model = model.trim().to_string();
            }
        }
        if let Ok(base_url) = std::env::var("ATLAS_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.llm.base_url = base_url.trim().to_string();
            }
        }
    }

    /// Effective settings for one agent.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }

    /// Overlay CLI options onto the file config.
    pub fn with_options(mut self, options: &RunOptions) -> Self {
        if let Some(workers) = options.max_workers {
            self.run.max_workers = workers;
        }
        if let Some(workers) = options.max_hash_workers {
            self.run.max_hash_workers = workers;
        }
        self.run
            .excluded_agents
            .extend(options.excluded_agents.iter().cloned());
        self
    }
}

/// Resolve `0` to the machine's available parallelism.
pub fn effective_workers(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let backup = path.with_extension("toml.bak");
    let _ = fs::write(backup, content);
}
