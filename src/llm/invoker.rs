//! The model invocation capability and its decorators.
//!
//! Invokers are composed explicitly at construction time:
//! `CachingInvoker -> RetryingInvoker -> HttpInvoker`. Each layer holds the
//! next one behind an `Arc<dyn Invoker>`.

use super::key::generate_key;
use super::request::{CompletionRequest, CompletionResponse};
use crate::cache::ResponseCache;
use crate::error::InvokeError;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 2000;
pub const BACKOFF_MULTIPLIER: u32 = 2;

pub trait Invoker: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<CompletionResponse, InvokeError>>;
}

/// Retries retryable failures with exponential backoff.
pub struct RetryingInvoker {
    inner: Arc<dyn Invoker>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl RetryingInvoker {
    pub fn new(inner: Arc<dyn Invoker>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Delay before retry number `retry_count` (1-based).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(retry_count.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

impl Invoker for RetryingInvoker {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<CompletionResponse, InvokeError>> {
        Box::pin(async move {
            let mut retry_count = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(InvokeError::Cancelled);
                }
                match self.inner.complete(request, cancel).await {
                    Ok(response) => return Ok(response),
                    Err(err) if err.is_retryable() && retry_count < self.max_retries => {
                        retry_count += 1;
                        let delay = self.backoff(retry_count);
                        tracing::debug!(
                            retry = retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying model request"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }
}

/// Serves repeated requests from the [`ResponseCache`].
pub struct CachingInvoker {
    inner: Arc<dyn Invoker>,
    cache: Arc<ResponseCache>,
}

impl CachingInvoker {
    pub fn new(inner: Arc<dyn Invoker>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }

    fn lookup(&self, key: &str) -> Option<CompletionResponse> {
        let entry = self.cache.get(key)?;
        match serde_json::from_str::<CompletionResponse>(&entry.response) {
            Ok(mut response) => {
                response.cached = true;
                Some(response)
            }
            Err(err) => {
                tracing::warn!(
                    key,
                    error = %err,
                    "cached response is unreadable; calling the model"
                );
                None
            }
        }
    }

    fn store(&self, key: &str, response: &CompletionResponse) {
        let serialized = match serde_json::to_string(response) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize response for caching");
                return;
            }
        };
        if let Err(err) = self.cache.put(key, serialized) {
            tracing::warn!(error = %err, "failed to cache model response");
        }
    }
}

impl Invoker for CachingInvoker {
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<CompletionResponse, InvokeError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }
            let key = match generate_key(request) {
                Ok(key) => Some(key),
                Err(err) => {
                    tracing::warn!(error = %err, "could not derive cache key; bypassing cache");
                    None
                }
            };

            if let Some(hit) = key.as_deref().and_then(|k| self.lookup(k)) {
                tracing::debug!(model = %request.model, "response cache hit");
                return Ok(hit);
            }

            let response = self.inner.complete(request, cancel).await?;
            if let Some(key) = key.as_deref() {
                self.store(key, &response);
            }
            Ok(response)
        })
    }
}
