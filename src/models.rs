//! Core data models that flow through the analysis pipeline.
//!
//! [`SourceFile`]s come in from the scanner, are grouped into [`Chunk`]s,
//! summarised into [`ChunkSummary`]s, merged into a [`Report`], and the
//! report then grounds a sequence of [`ConversationTurn`]s. [`RunProgress`]
//! is the event record streamed to observers while a run is in flight.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// One scanned file. `path` is relative to the repository root and unique
/// within a run; `content` is decoded text and never modified after the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Line that introduces the file inside a rendered chunk.
    pub fn header(&self) -> String {
        format!("--- {} ---\n", self.path)
    }
}

/// A group of files analysed by one map call.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position in the chunk sequence; reproduces original file order.
    pub index: usize,
    pub files: Vec<SourceFile>,
    /// Estimated tokens of the rendered files, headers and separators included.
    pub tokens: usize,
    /// Set when the chunk holds a single file cut down to fit the budget.
    pub truncated: bool,
}

impl Chunk {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    /// Render the chunk as the file-contents section of a prompt.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("{}{}\n", f.header(), f.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of one map call: a summary, or a recorded failure with
/// placeholder text standing in for the missing analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    pub index: usize,
    pub text: String,
    pub failed: bool,
    pub error: Option<String>,
}

impl ChunkSummary {
    pub fn ok(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            failed: false,
            error: None,
        }
    }

    pub fn failed(index: usize, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            index,
            text: format!(
                "[Analysis unavailable for this portion of the codebase (chunk {}): {}]",
                index + 1,
                error
            ),
            failed: true,
            error: Some(error),
        }
    }
}

/// How completely a report covers the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// Every chunk and merge succeeded.
    Complete,
    /// Some units failed; the text carries placeholder notes.
    Partial,
    /// The scan produced no analyzable files.
    Empty,
    /// The run was cancelled; the text holds whatever had completed.
    Cancelled,
}

/// Final output of a pipeline run. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub repository: String,
    pub text: String,
    pub generated_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub chunks: usize,
    pub failed_chunks: usize,
}

impl Report {
    pub fn new(
        repository: impl Into<String>,
        text: impl Into<String>,
        status: ReportStatus,
        chunks: usize,
        failed_chunks: usize,
    ) -> Self {
        Self {
            repository: repository.into(),
            text: text.into(),
            generated_at: Utc::now(),
            status,
            chunks,
            failed_chunks,
        }
    }

    /// The degenerate report produced when nothing was analyzable.
    pub fn empty(repository: impl Into<String>) -> Self {
        let repository = repository.into();
        let text = format!(
            "# Analysis of {repository}\n\nNo analyzable files were found. The scan returned no \
             text files after binary, size and ignore-pattern filtering, so there is nothing to report."
        );
        Self::new(repository, text, ReportStatus::Empty, 0, 0)
    }

    pub fn is_complete(&self) -> bool {
        self.status == ReportStatus::Complete
    }
}

/// One follow-up question and its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    /// Strictly increasing from 0 within a session.
    pub sequence: u64,
    pub question: String,
    pub answer: String,
}

/// Stage identifier carried by progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Chunking,
    Mapping,
    Reducing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Chunking => "chunking",
            Stage::Mapping => "mapping",
            Stage::Reducing => "reducing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A streamed progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    /// Strictly increasing within a run, starting at 0.
    pub sequence: u64,
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
