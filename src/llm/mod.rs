//! Model invocation: request types, cache keys, and the invoker stack.

pub mod client;
pub mod invoker;
pub mod key;
pub mod request;

pub use client::HttpInvoker;
pub use invoker::{CachingInvoker, Invoker, RetryingInvoker};
pub use key::generate_key;
pub use request::{ChatMessage, CompletionRequest, CompletionResponse, ToolDefinition, Usage};

use crate::cache::ResponseCache;
use crate::config::LlmConfig;
use std::sync::Arc;

/// Build the standard `CachingInvoker -> RetryingInvoker -> HttpInvoker`
/// stack. A missing API key is not an error here: cached responses are
/// still served and only real model calls fail.
pub fn build_invoker(
    config: &LlmConfig,
    cache: Arc<ResponseCache>,
) -> anyhow::Result<Arc<dyn Invoker>> {
    let api_key = config.api_key();
    if api_key.is_none() {
        tracing::debug!(env = %config.api_key_env, "no API key configured");
    }
    let http: Arc<dyn Invoker> = Arc::new(HttpInvoker::new(config, api_key)?);
    let retrying: Arc<dyn Invoker> = Arc::new(RetryingInvoker::new(http, config.max_retries));
    Ok(Arc::new(CachingInvoker::new(retrying, cache)))
}
