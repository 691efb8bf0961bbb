//! Error taxonomy for the analysis pipeline.
//!
//! Unit-level failures (one map or merge call exhausting its retries) never
//! appear here as run errors: they are folded into [`ChunkSummary`] values
//! so downstream stages always see a complete, index-aligned sequence.
//! Only configuration problems, run-fatal service rejections, total stage
//! failure and cancellation-with-nothing-done terminate a run.
//!
//! [`ChunkSummary`]: crate::models::ChunkSummary

use std::time::Duration;
use thiserror::Error;

use crate::models::Stage;

/// Failure of a single completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The service throttled the request (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The call did not finish within the per-call deadline.
    #[error("call exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// Non-success status from the service.
    #[error("service error {status}: {message}")]
    Service {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// The service answered but the payload was malformed or empty.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Credentials were rejected. Retrying cannot help.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connection-level failure before a status was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// The run's cancellation signal fired while the call was pending.
    #[error("call cancelled")]
    Cancelled,
}

impl CompletionError {
    /// Transient failures worth another attempt under the retry ceiling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompletionError::RateLimited(_)
                | CompletionError::Transport(_)
                | CompletionError::Service {
                    retryable: true,
                    ..
                }
        )
    }

    /// Failures that doom every other call of the run too.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, CompletionError::Authentication(_))
    }
}

/// Invalid configuration, detected before any call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    NonPositive { field: &'static str },

    #[error("{field} must be >= {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: usize,
        value: usize,
    },

    #[error("{field} of {budget} leaves no room for content after {overhead} tokens of prompt text")]
    BudgetExhausted {
        field: &'static str,
        budget: usize,
        overhead: usize,
    },

    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Run-terminating pipeline failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("all {failed} unit(s) failed during {stage}: {last_error}")]
    TotalFailure {
        stage: Stage,
        failed: usize,
        last_error: String,
    },

    #[error("completion service rejected the run: {0}")]
    Fatal(CompletionError),

    #[error("run cancelled before any work completed")]
    Cancelled,
}

impl PipelineError {
    /// Short machine-readable classification used by transports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::TotalFailure { .. } => "total_failure",
            PipelineError::Fatal(_) => "fatal",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

/// Failure of a follow-up question.
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("question must not be empty")]
    EmptyQuestion,

    #[error(transparent)]
    Completion(#[from] CompletionError),
}
