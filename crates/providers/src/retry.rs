//! Retry wrapper — re-issues requests that failed transiently.
//!
//! Only establishing a request is retried. Once a stream has started, a
//! mid-stream failure is passed through to the caller.

use async_trait::async_trait;
use clawlink_core::error::ProviderError;
use clawlink_core::provider::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Wraps a provider and retries transient errors with linear backoff.
pub struct RetryingProvider {
    inner: Arc<dyn Provider>,
    max_retries: u32,
    backoff: Duration,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn Provider>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            backoff: Duration::from_secs(1),
        }
    }

    /// Base delay; attempt `n` waits `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn delay(&self, attempt: u32, error: &ProviderError) -> Duration {
        let linear = self.backoff * attempt;
        match error {
            ProviderError::RateLimited { retry_after_secs } => {
                linear.max(Duration::from_secs(*retry_after_secs))
            }
            _ => linear,
        }
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(provider = %self.inner.name(), op, attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay(attempt, &e);
                    warn!(
                        provider = %self.inner.name(),
                        op,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Provider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.with_retries("complete", || self.inner.complete(request.clone())).await
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.with_retries("stream", || self.inner.stream(request.clone())).await
    }
}
