//! Runtime configuration.
//!
//! Bridges environment settings with the directory layout the pipeline
//! writes into: one output directory holding the checkpoint, the progress
//! log and the exported reports.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::llm::RetryPolicy;

pub const DEFAULT_OUT_DIR: &str = "research_result";
pub const DEFAULT_WORD_LIMIT: u32 = 1000;

/// Settings for the generation endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

/// Runtime configuration for a Scribe process.
#[derive(Debug, Clone)]
pub struct Config {
    pub out_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub progress_log: PathBuf,
    pub reports_dir: PathBuf,
    pub section_concurrency: usize,
    pub llm: LlmConfig,
    pub serper_api_key: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build a configuration rooted at `out_dir`, reading endpoint settings
    /// from the environment.
    pub fn from_env(out_dir: impl Into<PathBuf>) -> Self {
        let out_dir = out_dir.into();
        Self {
            checkpoint_path: out_dir.join("checkpoint.json"),
            progress_log: out_dir.join("progress.jsonl"),
            reports_dir: out_dir.join("reports"),
            out_dir,
            section_concurrency: env_or("SECTION_CONCURRENCY", 2),
            llm: LlmConfig {
                base_url: std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                model: std::env::var("OPENAI_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                timeout_seconds: env_or("LLM_TIMEOUT_SECONDS", 120),
                max_retries: env_or("LLM_MAX_RETRIES", 2),
                retry_backoff_ms: env_or("LLM_RETRY_BACKOFF_MS", 500),
            },
            serper_api_key: std::env::var("SERPER_API_KEY").ok(),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir).context("Failed to create output directory")?;
        std::fs::create_dir_all(&self.reports_dir)
            .context("Failed to create reports directory")?;
        Ok(())
    }
}
