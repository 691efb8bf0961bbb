//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, see [`load_or_default`]) yields a usable configuration. Validation
//! runs before any completion call is made and reports [`ConfigError`]s.
//!
//! ```toml
//! [llm]
//! model = "google/gemini-2.5-flash-lite"
//! api_key_env = "OPENROUTER_API_KEY"
//! timeout_secs = 120
//! max_retries = 3
//!
//! [pipeline]
//! map_token_budget = 60000
//! merge_token_budget = 90000
//! workers = 8
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Hard request limit of the model, in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            max_output_tokens: default_max_output_tokens(),
            context_window: default_context_window(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_model() -> String {
    "google/gemini-2.5-flash-lite".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_context_window() -> usize {
    131_072
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Estimated tokens of file content per map call.
    #[serde(default = "default_map_token_budget")]
    pub map_token_budget: usize,
    /// Estimated tokens of summary text per merge or synthesis call.
    #[serde(default = "default_merge_token_budget")]
    pub merge_token_budget: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on summaries merged by one call.
    #[serde(default = "default_max_group_size")]
    pub max_group_size: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_conversation_token_budget")]
    pub conversation_token_budget: usize,
    /// Budget for the project file listing included in prompts.
    #[serde(default = "default_tree_token_budget")]
    pub tree_token_budget: usize,
    /// Analyse a repository that fits one chunk with a single call.
    #[serde(default = "default_single_pass")]
    pub single_pass: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            map_token_budget: default_map_token_budget(),
            merge_token_budget: default_merge_token_budget(),
            workers: default_workers(),
            max_group_size: default_max_group_size(),
            chars_per_token: default_chars_per_token(),
            conversation_token_budget: default_conversation_token_budget(),
            tree_token_budget: default_tree_token_budget(),
            single_pass: default_single_pass(),
        }
    }
}

fn default_map_token_budget() -> usize {
    60_000
}
fn default_merge_token_budget() -> usize {
    90_000
}
fn default_workers() -> usize {
    8
}
fn default_max_group_size() -> usize {
    20
}
fn default_chars_per_token() -> usize {
    crate::tokens::DEFAULT_CHARS_PER_TOKEN
}
fn default_conversation_token_budget() -> usize {
    100_000
}
fn default_tree_token_budget() -> usize {
    4_000
}
fn default_single_pass() -> bool {
    true
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.map_token_budget == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.map_token_budget",
            });
        }
        if self.merge_token_budget == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.merge_token_budget",
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.workers",
            });
        }
        if self.max_group_size < 2 {
            return Err(ConfigError::TooSmall {
                field: "pipeline.max_group_size",
                min: 2,
                value: self.max_group_size,
            });
        }
        if self.chars_per_token == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.chars_per_token",
            });
        }
        if self.conversation_token_budget == 0 {
            return Err(ConfigError::NonPositive {
                field: "pipeline.conversation_token_budget",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Extra glob patterns (relative paths) to skip, on top of the built-ins.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Sessions kept at once; the least recently used one is dropped to
    /// make room for a new session.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_max_sessions() -> usize {
    256
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;

        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::NonPositive {
                field: "llm.timeout_secs",
            });
        }
        if self.llm.max_output_tokens == 0 {
            return Err(ConfigError::NonPositive {
                field: "llm.max_output_tokens",
            });
        }
        if self.server.max_sessions == 0 {
            return Err(ConfigError::NonPositive {
                field: "server.max_sessions",
            });
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.base_url must not be empty".into()));
        }

        // Budgets are soft; keep them under 90% of the hard service limit.
        let ceiling = self.llm.context_window / 10 * 9;
        for (field, budget) in [
            ("pipeline.map_token_budget", self.pipeline.map_token_budget),
            ("pipeline.merge_token_budget", self.pipeline.merge_token_budget),
            (
                "pipeline.conversation_token_budget",
                self.pipeline.conversation_token_budget,
            ),
        ] {
            if budget > ceiling {
                tracing::warn!(
                    field,
                    budget,
                    context_window = self.llm.context_window,
                    "token budget exceeds 90% of the model context window"
                );
            }
        }

        Ok(())
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Like [`load_config`], but a missing file yields the validated defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    tracing::debug!(path = %path.display(), "config file not found, using defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}
