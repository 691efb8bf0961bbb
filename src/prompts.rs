//! Prompt templates.
//!
//! Every request shares [`SYSTEM_PROMPT`] and a [`PromptContext`] carrying
//! the repository name and its bounded file listing. The map prompt asks for
//! a per-chunk summary, the merge prompt consolidates numbered summaries, and
//! the synthesis and full-analysis prompts ask for the eight-section report.

use crate::completion::{CompletionRequest, Message};
use crate::models::{Chunk, SourceFile};
use crate::tokens::TokenEstimator;

pub const SYSTEM_PROMPT: &str = "You are a senior software architect reviewing an unfamiliar codebase. \
Work only from the code and summaries you are given. For each project, establish its purpose and \
architecture, how its directories are organised, what each file is responsible for, how the components \
depend on and call each other, where execution starts and how data moves through the system, and which \
architectural patterns it follows. When answering follow-up questions, cite concrete files and functions, \
trace execution paths when asked, and say so plainly when the material does not contain the answer.";

/// Separator between numbered summaries in merge and synthesis prompts.
pub const SUMMARY_SEPARATOR: &str = "\n\n---\n\n";

const REPORT_SECTIONS: &str = "\
### 1. Project Overview
What the project does and why it exists.

### 2. Directory Structure & Organization
How the tree is laid out and the reasoning behind it.

### 3. File Inventory & Purposes
For each file: its responsibility, its key functions, types or exports, and its role in the system.

### 4. Component Interactions & Relationships
Which modules call or depend on which, and how.

### 5. Dependency Map
Internal import relationships between files, plus the external libraries in use.

### 6. Entry Points & Data Flow
The entry points, and how data travels from input to output.

### 7. Architecture Patterns
Architectural patterns and design principles visible in the code.

### 8. Summary
A short assessment of the design's strengths and overall quality.";

/// Repository-wide context shared by every prompt of a run.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub repository: String,
    /// Indented file tree, already bounded by the listing budget.
    pub listing: String,
}

impl PromptContext {
    /// Context for a run over `files`, listing their paths within `listing_budget`.
    pub fn new(
        repository: impl Into<String>,
        files: &[SourceFile],
        estimator: &TokenEstimator,
        listing_budget: usize,
    ) -> Self {
        Self {
            repository: repository.into(),
            listing: file_listing(files.iter().map(|f| f.path.as_str()), estimator, listing_budget),
        }
    }

    fn header(&self, listing_title: &str) -> String {
        format!(
            "## Repository\n{}\n\n## {}\n```\n{}\n```\n",
            self.repository,
            listing_title,
            self.listing.trim_end()
        )
    }
}

fn request(user: String, max_output_tokens: u32) -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::system(SYSTEM_PROMPT), Message::user(user)],
        max_output_tokens,
    }
}

/// Summarise one chunk of a larger codebase.
pub fn map_request(
    ctx: &PromptContext,
    chunk: &Chunk,
    total_chunks: usize,
    max_output_tokens: u32,
) -> CompletionRequest {
    let user = format!(
        "The codebase is too large to read at once, so you are seeing it in parts. \
         This is chunk {} of {}.\n\n{}\n## File Contents (this chunk only)\n{}\n---\n\n\
         Write a compact technical summary of the files in this chunk:\n\
         - each file and its main responsibility\n\
         - key types, functions and exports\n\
         - imports and dependencies visible here\n\
         - entry points and notable patterns\n\n\
         This summary will later be merged with the summaries of the other chunks.",
        chunk.index + 1,
        total_chunks,
        ctx.header("Directory Structure (full project)"),
        chunk.render()
    );
    request(user, max_output_tokens)
}

/// Consolidate a group of summaries into one intermediate summary.
pub fn merge_request(
    ctx: &PromptContext,
    summaries: &[String],
    max_output_tokens: u32,
) -> CompletionRequest {
    let user = format!(
        "Consolidate the following partial summaries of one codebase into a single \
         intermediate summary.\n\n{}\n## Partial Summaries\n{}\n\n---\n\n\
         Keep every file name and responsibility, every key type and function, every \
         dependency relationship and every entry point. Remove repetition, not information.",
        ctx.header("Directory Structure"),
        join_summaries(summaries)
    );
    request(user, max_output_tokens)
}

/// Turn the final level of summaries into the report.
pub fn synthesis_request(
    ctx: &PromptContext,
    summaries: &[String],
    total_chunks: usize,
    max_output_tokens: u32,
) -> CompletionRequest {
    let user = format!(
        "You analysed this codebase in {} parts. Combine the summaries below into one \
         complete analysis report.\n\n{}\n## Summaries\n{}\n\n---\n\n\
         Structure the report with these sections:\n\n{}",
        total_chunks,
        ctx.header("Directory Structure"),
        join_summaries(summaries),
        REPORT_SECTIONS
    );
    request(user, max_output_tokens)
}

/// Analyse a codebase small enough to fit one request.
pub fn full_analysis_request(
    ctx: &PromptContext,
    chunk: &Chunk,
    max_output_tokens: u32,
) -> CompletionRequest {
    let user = format!(
        "Analyse the following codebase and write a complete report.\n\n{}\n\
         ## File Contents\n{}\n---\n\nStructure the report with these sections:\n\n{}",
        ctx.header("Directory Structure"),
        chunk.render(),
        REPORT_SECTIONS
    );
    request(user, max_output_tokens)
}

fn empty_chunk(position: usize) -> Chunk {
    Chunk {
        index: position.saturating_sub(1),
        files: Vec::new(),
        tokens: 0,
        truncated: false,
    }
}

/// Estimated tokens a map request spends before any file content: system
/// prompt, template and listing. `total_chunks` bounds the chunk numbering.
pub fn map_overhead(ctx: &PromptContext, estimator: &TokenEstimator, total_chunks: usize) -> usize {
    let req = map_request(ctx, &empty_chunk(total_chunks), total_chunks, 0);
    estimator.estimate(&req.text())
}

/// Fixed cost of a full-analysis request.
pub fn full_analysis_overhead(ctx: &PromptContext, estimator: &TokenEstimator) -> usize {
    estimator.estimate(&full_analysis_request(ctx, &empty_chunk(1), 0).text())
}

/// Fixed cost of the larger of the merge and synthesis requests, i.e. what
/// a reduce call spends before any summary text.
pub fn reduce_overhead(ctx: &PromptContext, estimator: &TokenEstimator, total_chunks: usize) -> usize {
    let merge = estimator.estimate(&merge_request(ctx, &[], 0).text());
    let synthesis = estimator.estimate(&synthesis_request(ctx, &[], total_chunks, 0).text());
    merge.max(synthesis)
}

/// Opening messages of every follow-up conversation: the report presented
/// as an earlier exchange the model has acknowledged.
pub fn conversation_preamble(repository: &str, report_text: &str) -> Vec<Message> {
    vec![
        Message::system(SYSTEM_PROMPT),
        Message::user(format!(
            "I have analysed the codebase {repository}. The full analysis report follows; \
             use it to answer my follow-up questions.\n\n## Analysis Report\n{report_text}"
        )),
        Message::assistant(
            "Understood. I have read the analysis report and am ready for questions about this codebase.",
        ),
    ]
}

/// Number summaries from 1 and join them with [`SUMMARY_SEPARATOR`].
pub fn join_summaries<S: AsRef<str>>(summaries: &[S]) -> String {
    summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("### Summary {}\n{}", i + 1, s.as_ref()))
        .collect::<Vec<_>>()
        .join(SUMMARY_SEPARATOR)
}

/// Indented tree of `paths` (which should be sorted), cut to `budget` tokens.
///
/// ```text
/// src/
///   api/
///     routes.rs
///   main.rs
/// Cargo.toml
/// ```
pub fn file_listing<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    estimator: &TokenEstimator,
    budget: usize,
) -> String {
    let mut out = String::new();
    let mut prev: Vec<&str> = Vec::new();

    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        let (dirs, name) = parts.split_at(parts.len() - 1);
        let shared = prev.iter().zip(dirs).take_while(|(a, b)| a == b).count();

        for (depth, dir) in dirs.iter().enumerate().skip(shared) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(dir);
            out.push_str("/\n");
        }
        out.push_str(&"  ".repeat(dirs.len()));
        out.push_str(name[0]);
        out.push('\n');

        prev = dirs.to_vec();
    }

    estimator.truncate(&out, budget).into_owned()
}
