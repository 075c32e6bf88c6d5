//! LLM provider implementations for ClawLink.
//!
//! All providers implement the `clawlink_core::Provider` trait.

pub mod openai_compat;
pub mod retry;

pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryingProvider;

use clawlink_config::ProviderConfig;
use clawlink_core::error::ProviderError;
use clawlink_core::provider::Provider;
use std::sync::Arc;

/// Build the configured provider, wrapped in retries when enabled.
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let base: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::from_config(config)?);
    if config.max_retries == 0 {
        return Ok(base);
    }
    Ok(Arc::new(RetryingProvider::new(base, config.max_retries)))
}
