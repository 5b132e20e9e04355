//! Error taxonomy for the analysis engine.
//!
//! Cache and scan errors are always recovered where they happen (the run
//! prefers redundant work over failing). Agent errors are captured per
//! task. Only [`RunError::AllAgentsFailed`] reaches the top-level caller.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to walk the repository.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan root {} does not exist", .0.display())]
    RootMissing(PathBuf),
    #[error("scan root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid ignore pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("failed to start hash workers: {0}")]
    WorkerPool(String),
}

/// Failure to read or persist one of the cache files.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file {} is not valid JSON: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timed out waiting for cache lock ({0}s)")]
    LockTimeout(u64),
    #[error("`{0}` is not a 64-character hex cache key")]
    InvalidKey(String),
    #[error("cache state was poisoned by a panicking task")]
    Poisoned,
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of a single model invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("model request was cancelled")]
    Cancelled,
    #[error("rate limited by provider: {0}")]
    RateLimited(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("model is not configured: {0}")]
    NotConfigured(String),
}

impl InvokeError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::RateLimited(_) | InvokeError::Network(_) => true,
            InvokeError::Status { status, .. } => *status >= 500,
            InvokeError::Cancelled | InvokeError::Malformed(_) | InvokeError::NotConfigured(_) => {
                false
            }
        }
    }
}

/// Outcome of a pool task that did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The shared cancellation token fired before or while the task ran.
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }
}

/// Fatal run outcome surfaced to the caller.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("all {} dispatched agents failed", failed.len())]
    AllAgentsFailed { failed: Vec<(String, String)> },
}
