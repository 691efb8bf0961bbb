//! Pipeline orchestration: Chunk → Map → Reduce → Report.
//!
//! A [`Pipeline`] is built once from validated configuration and can run
//! any number of times; each [`Pipeline::run`] owns its own chunk list,
//! summaries and progress sequence. Runs move strictly forward through
//! [`RunState`]:
//!
//! ```text
//! Idle → Scanning → Chunking → Mapping → Reducing → Done
//!                                    ↘        ↘         ↘
//!                                     Failed   Failed    Failed
//! ```
//!
//! An empty file list is not a failure: it yields [`Report::empty`]. A
//! repository whose one chunk fits the full-analysis prompt is analysed with
//! a single call when `single_pass` is on, skipping the reduce stage.
//!
//! Budgets bound whole requests. Before packing, the fixed part of the map
//! prompt (system prompt, template, file listing) is subtracted from
//! `map_token_budget`, and the reduce stage does the same with
//! `merge_token_budget`. A budget with nothing left is a [`ConfigError`]
//! raised before the first call.
//!
//! # Cancellation
//!
//! The caller's [`CancellationToken`] stops dispatch of new calls and aborts
//! in-flight ones. The run then ends with a [`ReportStatus::Cancelled`]
//! report built from whatever summaries had completed, or with
//! [`PipelineError::Cancelled`] when nothing had.

use tokio_util::sync::CancellationToken;

use crate::chunk::Chunker;
use crate::completion::CompletionClient;
use crate::config::{Config, PipelineConfig};
use crate::conversation::ConversationContext;
use crate::error::{CompletionError, ConfigError, PipelineError};
use crate::map::MapStage;
use crate::models::{Chunk, Report, ReportStatus, SourceFile, Stage};
use crate::pool::WorkerPool;
use crate::progress::{ProgressEmitter, ProgressSink};
use crate::prompts::{self, PromptContext, SUMMARY_SEPARATOR};
use crate::reduce::ReduceStage;
use crate::tokens::TokenEstimator;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    Chunking,
    Mapping,
    Reducing,
    Done,
    Failed,
}

impl RunState {
    fn rank(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Scanning => 1,
            RunState::Chunking => 2,
            RunState::Mapping => 3,
            RunState::Reducing => 4,
            RunState::Done | RunState::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Transitions only move forward and never leave a terminal state.
    pub fn can_advance_to(self, next: RunState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Tracks the state of one run and logs each transition.
struct RunTracker {
    state: RunState,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        if self.state.can_advance_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "run state");
            self.state = next;
        } else {
            tracing::warn!(from = ?self.state, to = ?next, "ignored backward run state transition");
        }
    }
}

/// Prompt context and chunks of one run. The chunk budget is what the map
/// prompt leaves once its template and listing are paid for.
struct Prepared {
    ctx: PromptContext,
    chunks: Vec<Chunk>,
    content_budget: usize,
    single_pass: bool,
}

fn prepare(
    config: &PipelineConfig,
    estimator: TokenEstimator,
    chunker: &Chunker,
    repository: &str,
    files: Vec<SourceFile>,
) -> Result<Prepared, ConfigError> {
    let ctx = PromptContext::new(repository, &files, &estimator, config.tree_token_budget);
    if files.is_empty() {
        return Ok(Prepared {
            ctx,
            chunks: Vec::new(),
            content_budget: chunker.budget(),
            single_pass: false,
        });
    }

    // A run never has more chunks than files, which bounds the numbering.
    let chunker = chunker.reserve(prompts::map_overhead(&ctx, &estimator, files.len()))?;
    let chunks = chunker.chunk(files);
    let single_pass = config.single_pass
        && chunks.len() == 1
        && chunks[0].tokens + prompts::full_analysis_overhead(&ctx, &estimator)
            <= config.map_token_budget;

    Ok(Prepared {
        ctx,
        chunks,
        content_budget: chunker.budget(),
        single_pass,
    })
}

/// What a run would do, without calling the service.
#[derive(Debug)]
pub struct RunPlan {
    pub files: usize,
    pub estimated_tokens: usize,
    /// Map budget left for file contents after the prompt around them.
    pub content_budget: usize,
    pub chunks: Vec<Chunk>,
    /// The whole repository would go out in one call.
    pub single_pass: bool,
}

impl RunPlan {
    /// Chunk `files` under `config`. Needs no credentials.
    pub fn new(
        config: &PipelineConfig,
        repository: &str,
        files: Vec<SourceFile>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let estimator = TokenEstimator::new(config.chars_per_token);
        let chunker = Chunker::new(estimator, config.map_token_budget)?;
        let estimated_tokens = files.iter().map(|f| estimator.estimate(&f.content)).sum();
        let count = files.len();
        let prepared = prepare(config, estimator, &chunker, repository, files)?;
        Ok(Self {
            files: count,
            estimated_tokens,
            content_budget: prepared.content_budget,
            chunks: prepared.chunks,
            single_pass: prepared.single_pass,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    estimator: TokenEstimator,
    chunker: Chunker,
    client: CompletionClient,
    max_output_tokens: u32,
}

impl Pipeline {
    /// Validates `config` before anything else; no call is made on error.
    pub fn new(
        config: PipelineConfig,
        client: CompletionClient,
        max_output_tokens: u32,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if max_output_tokens == 0 {
            return Err(ConfigError::NonPositive {
                field: "llm.max_output_tokens",
            });
        }
        let estimator = TokenEstimator::new(config.chars_per_token);
        let chunker = Chunker::new(estimator, config.map_token_budget)?;
        Ok(Self {
            config,
            estimator,
            chunker,
            client,
            max_output_tokens,
        })
    }

    /// Pipeline over the configured HTTP service. Reads credentials.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = CompletionClient::from_config(&config.llm)?;
        Self::new(config.pipeline.clone(), client, config.llm.max_output_tokens)
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    /// Run the pipeline over `files`, streaming progress to `sink`.
    pub async fn run(
        &self,
        repository: &str,
        files: Vec<SourceFile>,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Report, PipelineError> {
        let progress = ProgressEmitter::new(sink);
        let mut tracker = RunTracker::new();
        tracker.advance(RunState::Scanning);

        let result = self
            .run_stages(repository, files, &progress, &cancel, &mut tracker)
            .await;

        match &result {
            Ok(report) => {
                tracker.advance(RunState::Done);
                let message = match report.status {
                    ReportStatus::Cancelled => "cancelled, partial report ready",
                    ReportStatus::Empty => "no analyzable files",
                    _ => "report ready",
                };
                progress.emit(
                    Stage::Done,
                    report.chunks,
                    report.chunks,
                    Some(message.to_string()),
                );
                tracing::info!(
                    repository,
                    status = ?report.status,
                    chunks = report.chunks,
                    failed_chunks = report.failed_chunks,
                    "analysis finished"
                );
            }
            Err(e) => {
                tracker.advance(RunState::Failed);
                progress.emit(Stage::Failed, 0, 0, Some(e.to_string()));
                tracing::error!(repository, error = %e, kind = e.kind(), "analysis failed");
            }
        }

        result
    }

    async fn run_stages(
        &self,
        repository: &str,
        files: Vec<SourceFile>,
        progress: &ProgressEmitter<'_>,
        cancel: &CancellationToken,
        tracker: &mut RunTracker,
    ) -> Result<Report, PipelineError> {
        tracker.advance(RunState::Chunking);
        let file_count = files.len();
        progress.emit(
            Stage::Chunking,
            0,
            file_count,
            Some(format!("chunking {file_count} file(s)")),
        );

        let Prepared {
            ctx,
            chunks,
            content_budget,
            single_pass,
        } = prepare(&self.config, self.estimator, &self.chunker, repository, files)?;
        tracing::debug!(repository, content_budget, "map prompt overhead reserved");
        progress.emit(
            Stage::Chunking,
            file_count,
            file_count,
            Some(format!("{} chunk(s)", chunks.len())),
        );

        if chunks.is_empty() {
            tracing::info!(repository, "no analyzable files");
            return Ok(Report::empty(repository));
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        tracker.advance(RunState::Mapping);
        if single_pass {
            return self.single_pass(repository, &ctx, &chunks[0], progress, cancel).await;
        }

        let total = chunks.len();
        let pool = WorkerPool::new(self.config.workers);
        let reduce = ReduceStage::new(
            self.client.clone(),
            pool,
            self.estimator,
            self.config.merge_token_budget,
            self.config.max_group_size,
            self.max_output_tokens,
        );
        // A merge budget the reduce prompt cannot fit is found before any map call.
        reduce.content_budget(&ctx, total)?;

        let map = MapStage::new(self.client.clone(), pool, self.max_output_tokens);
        let mapped = map.map(&ctx, &chunks, progress, cancel).await?;

        let failed_chunks = mapped.failed;
        if mapped.cancelled {
            let done: Vec<String> = mapped
                .summaries
                .into_iter()
                .filter(|s| !s.failed)
                .map(|s| s.text)
                .collect();
            if done.is_empty() {
                return Err(PipelineError::Cancelled);
            }
            let text = cancelled_text(repository, &done.join(SUMMARY_SEPARATOR), done.len(), total);
            return Ok(Report::new(
                repository,
                text,
                ReportStatus::Cancelled,
                total,
                failed_chunks,
            ));
        }

        tracker.advance(RunState::Reducing);
        let reduced = reduce
            .reduce(&ctx, mapped.summaries, total, progress, cancel)
            .await?;

        if reduced.cancelled {
            let text = cancelled_text(repository, &reduced.text, total - failed_chunks, total);
            return Ok(Report::new(
                repository,
                text,
                ReportStatus::Cancelled,
                total,
                failed_chunks,
            ));
        }

        if failed_chunks == 0 && reduced.failed_merges == 0 {
            return Ok(Report::new(
                repository,
                reduced.text,
                ReportStatus::Complete,
                total,
                0,
            ));
        }

        let text = format!(
            "{}\n\n---\n\n> **Coverage note:** {} of {} chunk(s) could not be analysed and {} \
             merge step(s) failed. Sections derived from them may be incomplete.",
            reduced.text.trim_end(),
            failed_chunks,
            total,
            reduced.failed_merges
        );
        Ok(Report::new(
            repository,
            text,
            ReportStatus::Partial,
            total,
            failed_chunks,
        ))
    }

    async fn single_pass(
        &self,
        repository: &str,
        ctx: &PromptContext,
        chunk: &Chunk,
        progress: &ProgressEmitter<'_>,
        cancel: &CancellationToken,
    ) -> Result<Report, PipelineError> {
        tracing::info!(repository, tokens = chunk.tokens, "codebase fits one request");
        progress.emit(
            Stage::Mapping,
            0,
            1,
            Some("analysing the whole codebase in one call".to_string()),
        );

        let request = prompts::full_analysis_request(ctx, chunk, self.max_output_tokens);
        match self.client.complete(&request, cancel).await {
            Ok(text) => {
                progress.emit(Stage::Mapping, 1, 1, Some("chunk 1/1 done".to_string()));
                Ok(Report::new(repository, text, ReportStatus::Complete, 1, 0))
            }
            Err(CompletionError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) if e.is_run_fatal() => Err(PipelineError::Fatal(e)),
            Err(e) => {
                progress.emit(
                    Stage::Mapping,
                    1,
                    1,
                    Some(format!("chunk 1/1 failed: {e}")),
                );
                Err(PipelineError::TotalFailure {
                    stage: Stage::Mapping,
                    failed: 1,
                    last_error: e.to_string(),
                })
            }
        }
    }

    /// Start a follow-up conversation grounded in `report`.
    pub fn conversation(&self, report: Report) -> ConversationContext {
        ConversationContext::new(
            report,
            self.client.clone(),
            self.estimator,
            self.config.conversation_token_budget,
            self.max_output_tokens,
        )
    }
}

fn cancelled_text(repository: &str, body: &str, done: usize, total: usize) -> String {
    format!(
        "# Partial analysis of {repository}\n\n> The analysis was cancelled after {done} of {total} \
         chunk(s) were summarised. The material below is unmerged and incomplete.\n\n{body}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::{client, ScriptedService};
    use crate::progress::RecordingProgress;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(map_budget: usize) -> PipelineConfig {
        PipelineConfig {
            map_token_budget: map_budget,
            merge_token_budget: 10_000,
            workers: 3,
            ..PipelineConfig::default()
        }
    }

    fn files(n: usize, tokens: usize) -> Vec<SourceFile> {
        (0..n)
            .map(|i| SourceFile::new(format!("src/f{i}.rs"), "x".repeat(tokens * 3)))
            .collect()
    }

    /// Map budget with room for `per_chunk` of `files` after the map prompt.
    fn map_budget(files: &[SourceFile], per_chunk: usize) -> usize {
        let est = TokenEstimator::new(3);
        let ctx = PromptContext::new("demo", files, &est, PipelineConfig::default().tree_token_budget);
        let cost = Chunker::new(est, 1).unwrap().file_cost(&files[0]);
        prompts::map_overhead(&ctx, &est, files.len()) + per_chunk * cost
    }

    fn pipeline(svc: Arc<ScriptedService>, map_budget: usize) -> Pipeline {
        Pipeline::new(config(map_budget), client(svc, 0), 256).unwrap()
    }

    #[test]
    fn state_machine_moves_forward_only() {
        assert!(RunState::Idle.can_advance_to(RunState::Scanning));
        assert!(RunState::Mapping.can_advance_to(RunState::Reducing));
        assert!(RunState::Mapping.can_advance_to(RunState::Done));
        assert!(RunState::Chunking.can_advance_to(RunState::Failed));
        assert!(!RunState::Reducing.can_advance_to(RunState::Mapping));
        assert!(!RunState::Done.can_advance_to(RunState::Failed));
        assert!(!RunState::Failed.can_advance_to(RunState::Done));
    }

    #[test]
    fn invalid_config_rejected_before_any_call() {
        let svc = ScriptedService::ok("unused");
        let mut cfg = config(100);
        cfg.workers = 0;
        let err = Pipeline::new(cfg, client(svc.clone(), 0), 256).err().unwrap();
        assert_eq!(
            err,
            ConfigError::NonPositive {
                field: "pipeline.workers"
            }
        );
        assert_eq!(svc.calls(), 0);
    }

    #[tokio::test]
    async fn empty_input_gives_empty_report() {
        let svc = ScriptedService::ok("unused");
        let sink = RecordingProgress::new();
        let report = pipeline(svc.clone(), 100)
            .run("demo", Vec::new(), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ReportStatus::Empty);
        assert_eq!(svc.calls(), 0);
        let last = sink.events().last().cloned().unwrap();
        assert_eq!(last.stage, Stage::Done);
    }

    #[tokio::test]
    async fn small_repository_uses_one_call() {
        let svc = ScriptedService::ok("FULL REPORT");
        let sink = RecordingProgress::new();
        let report = pipeline(svc.clone(), 10_000)
            .run("demo", files(3, 10), &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.text, "FULL REPORT");
        assert_eq!(report.status, ReportStatus::Complete);
        assert_eq!(svc.calls(), 1);
        assert!(!sink.events().iter().any(|e| e.stage == Stage::Reducing));
    }

    #[tokio::test]
    async fn map_then_reduce_produces_complete_report() {
        let svc = ScriptedService::new(|_, req| {
            let user = &req.messages[1].content;
            let text = if user.contains("This is chunk") { "chunk summary" } else { "FINAL" };
            (Duration::ZERO, Ok(text.to_string()))
        });
        let sink = RecordingProgress::new();
        let fs = files(4, 20);
        let report = pipeline(svc.clone(), map_budget(&fs, 1))
            .run("demo", fs, &sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.text, "FINAL");
        assert_eq!(report.chunks, 4);
        assert!(report.is_complete());
        assert_eq!(svc.calls(), 5);

        let events = sink.events();
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.sequence, i as u64);
        }
        let stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
        let first_reduce = stages.iter().position(|s| *s == Stage::Reducing).unwrap();
        assert!(stages[..first_reduce].iter().all(|s| *s != Stage::Done));
        assert_eq!(*stages.last().unwrap(), Stage::Done);
    }

    #[tokio::test]
    async fn total_map_failure_fails_the_run() {
        let svc = ScriptedService::new(|_, _| {
            (Duration::ZERO, Err(CompletionError::Transport("down".into())))
        });
        let sink = RecordingProgress::new();
        let fs = files(3, 20);
        let err = pipeline(svc, map_budget(&fs, 1))
            .run("demo", fs, &sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "total_failure");
        assert_eq!(sink.events().last().unwrap().stage, Stage::Failed);
    }

    #[tokio::test]
    async fn partial_failure_adds_coverage_note() {
        let svc = ScriptedService::new(|_, req| {
            let user = &req.messages[1].content;
            if user.contains("This is chunk 2 ") {
                (Duration::ZERO, Err(CompletionError::RateLimited("429".into())))
            } else if user.contains("This is chunk") {
                (Duration::ZERO, Ok("summary".into()))
            } else {
                (Duration::ZERO, Ok("FINAL".into()))
            }
        });
        let fs = files(3, 20);
        let report = pipeline(svc, map_budget(&fs, 1))
            .run(
                "demo",
                fs,
                &RecordingProgress::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, ReportStatus::Partial);
        assert_eq!(report.failed_chunks, 1);
        assert!(report.text.starts_with("FINAL"));
        assert!(report.text.contains("Coverage note"));
    }

    #[test]
    fn plan_reports_chunk_shape() {
        let fs = files(4, 20);
        let budget = map_budget(&fs, 1);
        let plan = RunPlan::new(&config(budget), "demo", fs).unwrap();
        assert_eq!(plan.files, 4);
        assert_eq!(plan.estimated_tokens, 80);
        assert_eq!(plan.chunks.len(), 4);
        assert!(plan.content_budget < budget);
        assert!(!plan.single_pass);

        let small = RunPlan::new(&config(10_000), "demo", files(4, 20)).unwrap();
        assert_eq!(small.chunks.len(), 1);
        assert!(small.single_pass);
    }

    #[test]
    fn map_requests_fit_budget_with_many_tiny_files() {
        let est = TokenEstimator::new(3);
        let cfg = config(8_000);
        let fs: Vec<SourceFile> = (0..3_000)
            .map(|i| SourceFile::new(format!("services/payments/internal/handlers/h{i}.go"), "x"))
            .collect();
        let chunker = Chunker::new(est, cfg.map_token_budget).unwrap();
        let prepared = prepare(&cfg, est, &chunker, "demo", fs).unwrap();

        assert!(prepared.chunks.len() > 1);
        let total = prepared.chunks.len();
        for chunk in &prepared.chunks {
            let req = prompts::map_request(&prepared.ctx, chunk, total, 256);
            let tokens = est.estimate(&req.text());
            assert!(tokens <= 8_000, "chunk {} request is {tokens} tokens", chunk.index);
        }
    }

    #[tokio::test]
    async fn budget_below_map_overhead_is_config_error() {
        let svc = ScriptedService::ok("unused");
        let err = pipeline(svc.clone(), 50)
            .run("demo", files(3, 20), &RecordingProgress::new(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigError::BudgetExhausted {
                field: "pipeline.map_token_budget",
                budget: 50,
                ..
            })
        ));
        assert_eq!(svc.calls(), 0);
    }

    #[tokio::test]
    async fn merge_budget_below_reduce_overhead_fails_before_mapping() {
        let svc = ScriptedService::ok("unused");
        let fs = files(3, 20);
        let cfg = PipelineConfig {
            merge_token_budget: 100,
            ..config(map_budget(&fs, 1))
        };
        let err = Pipeline::new(cfg, client(svc.clone(), 0), 256)
            .unwrap()
            .run("demo", fs, &RecordingProgress::new(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigError::BudgetExhausted {
                field: "pipeline.merge_token_budget",
                ..
            })
        ));
        assert_eq!(svc.calls(), 0);
    }
}
