//! Text-generation capability boundary.
//!
//! The pipeline only ever talks to a `Generator`; the provided
//! implementation is an OpenAI-style chat-completions client. Every call
//! site goes through `generate_with_retry`, which wraps the call with a
//! timeout and bounded exponential backoff.

pub mod openai;

pub use openai::OpenAiStyleClient;

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::ExternalCallError;

/// Sampling parameters for a generation call.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4000,
            top_p: 1.0,
        }
    }
}

impl GenerateParams {
    /// Larger output budget for full-report generation and revision.
    pub fn long_form() -> Self {
        Self {
            max_tokens: 6000,
            ..Self::default()
        }
    }
}

/// An opaque "generate text from instructions" capability.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<String, ExternalCallError>;
}

/// Timeout and retry budget for external calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Call the generator with a per-attempt timeout and exponential backoff.
///
/// Backoff doubles per attempt (`initial * 2^attempt`). The final error is
/// returned once the retry budget is exhausted.
pub async fn generate_with_retry(
    generator: &dyn Generator,
    prompt: &str,
    params: &GenerateParams,
    policy: RetryPolicy,
) -> Result<String, ExternalCallError> {
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::time::timeout(policy.timeout, generator.generate(prompt, params))
            .await
            .map_err(|_| ExternalCallError::Timeout {
                seconds: policy.timeout.as_secs(),
            })
            .and_then(|r| r);

        match outcome {
            Ok(text) => return Ok(text),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let backoff = policy.initial_backoff * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "generation call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
