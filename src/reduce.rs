//! Reduce stage: hierarchical merge of chunk summaries into the report.
//!
//! Each level either fits in one synthesis call, which produces the report,
//! or is packed into groups with the same greedy rule the chunker uses and
//! merged group by group on the worker pool. The budget these rules work
//! against is the merge budget less the fixed prompt around the summaries,
//! so every request the stage sends stays within `merge_token_budget`.
//! Every level has fewer units
//! than the one before it:
//!
//! - each summary entering a level is cut to half the merge budget, so any
//!   two of them fit one group, and every group except the last holds at
//!   least two summaries;
//! - a group of one is carried to the next level as is, without a call;
//! - a lone summary larger than the whole budget is truncated, never looped
//!   on.
//!
//! A failed merge does not stop the stage: its group's summaries are carried
//! forward unmerged behind a placeholder note. Only a level where every merge
//! failed, or a failed final synthesis, is a total failure.

use tokio_util::sync::CancellationToken;

use crate::chunk::{content_budget, pack_by_budget};
use crate::completion::{CompletionClient, CompletionRequest};
use crate::error::{CompletionError, ConfigError, PipelineError};
use crate::models::{ChunkSummary, Stage};
use crate::pool::WorkerPool;
use crate::progress::ProgressEmitter;
use crate::prompts::{self, PromptContext, SUMMARY_SEPARATOR};
use crate::tokens::TokenEstimator;

/// One merge pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceLevel {
    pub index: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ReduceOutcome {
    pub text: String,
    pub levels: Vec<ReduceLevel>,
    pub failed_merges: usize,
    /// Set when cancellation stopped the stage; `text` is then the joined
    /// summaries of the level that was in progress.
    pub cancelled: bool,
}

enum MergeJob {
    Pass(String),
    Merge(CompletionRequest),
}

enum MergeResult {
    Passed(String),
    Merged(String),
    Failed(CompletionError),
}

pub struct ReduceStage {
    client: CompletionClient,
    pool: WorkerPool,
    estimator: TokenEstimator,
    budget: usize,
    max_group_size: usize,
    max_output_tokens: u32,
}

impl ReduceStage {
    pub fn new(
        client: CompletionClient,
        pool: WorkerPool,
        estimator: TokenEstimator,
        budget: usize,
        max_group_size: usize,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            client,
            pool,
            estimator,
            budget: budget.max(1),
            max_group_size: max_group_size.max(2),
            max_output_tokens,
        }
    }

    /// Estimated cost a summary adds to a joined list besides its own text.
    fn item_overhead(&self) -> usize {
        self.estimator.estimate(SUMMARY_SEPARATOR) + self.estimator.estimate("### Summary 99999\n")
    }

    /// Tokens left for summary text in one merge or synthesis request once
    /// the prompt around it is accounted for.
    pub fn content_budget(
        &self,
        ctx: &PromptContext,
        total_chunks: usize,
    ) -> Result<usize, ConfigError> {
        let overhead = prompts::reduce_overhead(ctx, &self.estimator, total_chunks);
        content_budget("pipeline.merge_token_budget", self.budget, overhead)
    }

    pub async fn reduce(
        &self,
        ctx: &PromptContext,
        summaries: Vec<ChunkSummary>,
        total_chunks: usize,
        progress: &ProgressEmitter<'_>,
        cancel: &CancellationToken,
    ) -> Result<ReduceOutcome, PipelineError> {
        let mut current: Vec<String> = summaries.into_iter().map(|s| s.text).collect();
        let mut levels = Vec::new();
        let mut failed_merges = 0usize;
        let mut completed = 0usize;
        let mut planned = 0usize;
        let overhead = self.item_overhead();
        let budget = self.content_budget(ctx, total_chunks)?;

        tracing::info!(
            summaries = current.len(),
            budget,
            "reduce stage starting"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(cancelled(current, levels, failed_merges));
            }

            let joined = self.estimator.estimate(&prompts::join_summaries(&current));
            if joined <= budget || current.len() <= 1 {
                let inputs: Vec<String> = if current.len() == 1 {
                    let room = budget.saturating_sub(overhead).max(1);
                    vec![self.estimator.truncate(&current[0], room).into_owned()]
                } else {
                    current
                };

                planned += 1;
                progress.emit(
                    Stage::Reducing,
                    completed,
                    planned,
                    Some(format!(
                        "synthesising final report from {} summar{}",
                        inputs.len(),
                        if inputs.len() == 1 { "y" } else { "ies" }
                    )),
                );

                let request =
                    prompts::synthesis_request(ctx, &inputs, total_chunks, self.max_output_tokens);
                return match self.client.complete(&request, cancel).await {
                    Ok(text) => {
                        completed += 1;
                        progress.emit(
                            Stage::Reducing,
                            completed,
                            planned,
                            Some("report ready".to_string()),
                        );
                        tracing::info!(levels = levels.len(), failed_merges, "reduce stage finished");
                        Ok(ReduceOutcome {
                            text,
                            levels,
                            failed_merges,
                            cancelled: false,
                        })
                    }
                    Err(CompletionError::Cancelled) => Ok(cancelled(inputs, levels, failed_merges)),
                    Err(e) if e.is_run_fatal() => Err(PipelineError::Fatal(e)),
                    Err(e) => Err(PipelineError::TotalFailure {
                        stage: Stage::Reducing,
                        failed: 1,
                        last_error: e.to_string(),
                    }),
                };
            }

            let level_index = levels.len();
            let item_budget = (budget / 2).saturating_sub(overhead).max(1);
            let items: Vec<String> = current
                .iter()
                .map(|s| self.estimator.truncate(s, item_budget).into_owned())
                .collect();
            let item_count = items.len();
            let mut groups = pack_by_budget(items, budget, self.max_group_size, |s: &String| {
                self.estimator.estimate(s) + overhead
            });
            if groups.len() == item_count {
                // Nothing fit together under the budget; pair neighbours so
                // every level still shrinks.
                groups = pack_by_budget(groups.into_iter().flatten(), usize::MAX, 2, |_| 0);
            }

            let merges = groups.iter().filter(|g| g.len() > 1).count();
            let group_count = groups.len();
            planned += merges;
            progress.emit(
                Stage::Reducing,
                completed,
                planned,
                Some(format!(
                    "level {}: merging {} summaries into {}",
                    level_index + 1,
                    current.len(),
                    group_count
                )),
            );
            tracing::debug!(
                level = level_index + 1,
                inputs = current.len(),
                groups = group_count,
                merges,
                "reduce level"
            );

            let fallbacks: Vec<String> = groups.iter().map(|g| prompts::join_summaries(g)).collect();
            let jobs: Vec<MergeJob> = groups
                .into_iter()
                .map(|mut g| {
                    if g.len() > 1 {
                        MergeJob::Merge(prompts::merge_request(ctx, &g, self.max_output_tokens))
                    } else {
                        MergeJob::Pass(g.pop().unwrap_or_default())
                    }
                })
                .collect();

            let mut level_failed = 0usize;
            let mut merged = 0usize;
            let mut last_error = String::new();

            let slots = self
                .pool
                .run(
                    jobs,
                    cancel,
                    |_, job| {
                        let client = self.client.clone();
                        let token = cancel.clone();
                        async move {
                            match job {
                                MergeJob::Pass(text) => MergeResult::Passed(text),
                                MergeJob::Merge(request) => match client.complete(&request, &token).await {
                                    Ok(text) => MergeResult::Merged(text),
                                    Err(e) => MergeResult::Failed(e),
                                },
                            }
                        }
                    },
                    |index, result| match result {
                        MergeResult::Passed(_) => {}
                        MergeResult::Merged(_) => {
                            completed += 1;
                            merged += 1;
                            progress.emit(
                                Stage::Reducing,
                                completed,
                                planned,
                                Some(format!(
                                    "level {}: group {}/{} merged",
                                    level_index + 1,
                                    index + 1,
                                    group_count
                                )),
                            );
                        }
                        MergeResult::Failed(e) => {
                            completed += 1;
                            level_failed += 1;
                            last_error = e.to_string();
                            tracing::warn!(level = level_index + 1, group = index + 1, error = %e, "merge call failed");
                            progress.emit(
                                Stage::Reducing,
                                completed,
                                planned,
                                Some(format!(
                                    "level {}: group {}/{} failed, keeping its summaries unmerged: {}",
                                    level_index + 1,
                                    index + 1,
                                    group_count,
                                    e
                                )),
                            );
                        }
                    },
                )
                .await;

            if cancel.is_cancelled() {
                return Ok(cancelled(current, levels, failed_merges));
            }

            if let Some(MergeResult::Failed(e)) = slots
                .iter()
                .flatten()
                .find(|r| matches!(r, MergeResult::Failed(e) if e.is_run_fatal()))
            {
                return Err(PipelineError::Fatal(e.clone()));
            }

            if merges > 0 && level_failed == merges {
                return Err(PipelineError::TotalFailure {
                    stage: Stage::Reducing,
                    failed: level_failed,
                    last_error,
                });
            }

            let next: Vec<String> = slots
                .into_iter()
                .zip(fallbacks)
                .map(|(slot, fallback)| match slot {
                    Some(MergeResult::Passed(text)) | Some(MergeResult::Merged(text)) => text,
                    Some(MergeResult::Failed(e)) => unmerged(&e.to_string(), &fallback),
                    None => unmerged("worker task failed", &fallback),
                })
                .collect();

            failed_merges += level_failed;
            levels.push(ReduceLevel {
                index: level_index,
                inputs: current.len(),
                outputs: next.len(),
                failed: level_failed,
            });
            tracing::info!(
                level = level_index + 1,
                inputs = current.len(),
                outputs = next.len(),
                merged,
                failed = level_failed,
                "reduce level complete"
            );
            current = next;
        }
    }
}

fn unmerged(error: &str, fallback: &str) -> String {
    format!("[Merge unavailable for this group of summaries: {error}]\n\n{fallback}")
}

fn cancelled(inputs: Vec<String>, levels: Vec<ReduceLevel>, failed_merges: usize) -> ReduceOutcome {
    tracing::info!(summaries = inputs.len(), "reduce stage cancelled");
    ReduceOutcome {
        text: inputs.join(SUMMARY_SEPARATOR),
        levels,
        failed_merges,
        cancelled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::{client, ScriptedService};
    use crate::progress::RecordingProgress;
    use std::sync::Arc;
    use std::time::Duration;

    const MERGE_MARK: &str = "Consolidate the following partial summaries";
    const SYNTH_MARK: &str = "Combine the summaries below";

    fn ctx() -> PromptContext {
        PromptContext {
            repository: "demo".into(),
            listing: String::new(),
        }
    }

    fn summaries(n: usize, chars: usize) -> Vec<ChunkSummary> {
        (0..n)
            .map(|i| ChunkSummary::ok(i, format!("{i:03}{}", "s".repeat(chars - 3))))
            .collect()
    }

    /// Merge budget leaving `content` tokens for summaries around the prompt.
    fn merge_budget(content: usize) -> usize {
        prompts::reduce_overhead(&ctx(), &TokenEstimator::new(3), 99) + content
    }

    fn stage(svc: Arc<ScriptedService>, content: usize) -> ReduceStage {
        ReduceStage::new(
            client(svc, 0),
            WorkerPool::new(4),
            TokenEstimator::new(3),
            merge_budget(content),
            20,
            256,
        )
    }

    fn is_merge(req: &CompletionRequest) -> bool {
        req.messages[1].content.contains(MERGE_MARK)
    }

    #[tokio::test]
    async fn fitting_summaries_need_one_call() {
        let svc = ScriptedService::ok("FINAL");
        let sink = RecordingProgress::new();
        let out = stage(svc.clone(), 10_000)
            .reduce(&ctx(), summaries(4, 90), 4, &ProgressEmitter::new(&sink), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.text, "FINAL");
        assert!(out.levels.is_empty());
        assert_eq!(svc.calls(), 1);
        assert!(svc.requests()[0].messages[1].content.contains(SYNTH_MARK));
        let last = sink.events().last().cloned().unwrap();
        assert_eq!(last.message.as_deref(), Some("report ready"));
        assert_eq!(last.completed, last.total);
    }

    #[tokio::test]
    async fn oversized_level_is_merged_hierarchically() {
        let svc = ScriptedService::new(|_, req| {
            let text = if is_merge(req) { "merged summary" } else { "FINAL" };
            (Duration::ZERO, Ok(text.to_string()))
        });
        let out = stage(svc.clone(), 250)
            .reduce(
                &ctx(),
                summaries(10, 300),
                10,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.text, "FINAL");
        assert_eq!(out.levels.len(), 1);
        assert_eq!(out.levels[0].inputs, 10);
        assert_eq!(out.levels[0].outputs, 5);
        assert_eq!(svc.calls(), 6);

        let est = TokenEstimator::new(3);
        for req in svc.requests() {
            assert!(est.estimate(&req.text()) <= merge_budget(250));
        }
    }

    #[tokio::test]
    async fn budget_below_prompt_overhead_is_rejected() {
        let svc = ScriptedService::ok("FINAL");
        let small = ReduceStage::new(
            client(svc.clone(), 0),
            WorkerPool::new(1),
            TokenEstimator::new(3),
            100,
            20,
            256,
        );
        let err = small
            .reduce(
                &ctx(),
                summaries(3, 30),
                3,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigError::BudgetExhausted {
                field: "pipeline.merge_token_budget",
                budget: 100,
                ..
            })
        ));
        assert_eq!(svc.calls(), 0);
    }

    #[tokio::test]
    async fn merge_groups_keep_chunk_order() {
        let svc = ScriptedService::new(|_, req| {
            if is_merge(req) {
                // Echo the first summary's tag so order is observable.
                let body = &req.messages[1].content;
                let at = body.find("### Summary 1\n").unwrap() + "### Summary 1\n".len();
                (Duration::ZERO, Ok(format!("m{}", &body[at..at + 3])))
            } else {
                (Duration::ZERO, Ok(req.messages[1].content.clone()))
            }
        });
        let out = stage(svc, 250)
            .reduce(
                &ctx(),
                summaries(8, 300),
                8,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let positions: Vec<usize> = ["m000", "m002", "m004", "m006"]
            .iter()
            .map(|tag| out.text.find(tag).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn single_summary_larger_than_budget_is_truncated() {
        let svc = ScriptedService::ok("FINAL");
        let est = TokenEstimator::new(3);
        let out = stage(svc.clone(), 100)
            .reduce(
                &ctx(),
                vec![ChunkSummary::ok(0, "z".repeat(30_000))],
                1,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.text, "FINAL");
        assert_eq!(svc.calls(), 1);
        let sent = &svc.requests()[0];
        assert!(sent.messages[1].content.contains("truncated: ~10000 tokens"));
        assert!(est.estimate(&sent.text()) <= merge_budget(100));
    }

    #[tokio::test]
    async fn huge_summaries_still_terminate() {
        let svc = ScriptedService::new(|_, req| {
            // Merges return text far larger than the budget.
            let text = if is_merge(req) { "y".repeat(5_000) } else { "FINAL".to_string() };
            (Duration::ZERO, Ok(text))
        });
        let out = stage(svc, 60)
            .reduce(
                &ctx(),
                summaries(40, 3_000),
                40,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.text, "FINAL");
        for pair in out.levels.windows(2) {
            assert!(pair[1].inputs < pair[0].inputs);
        }
        assert!(out.levels.iter().all(|l| l.outputs < l.inputs));
    }

    #[tokio::test]
    async fn failed_merge_keeps_placeholder_and_continues() {
        let svc = ScriptedService::new(|n, req| {
            if is_merge(req) && n == 0 {
                (Duration::ZERO, Err(CompletionError::Transport("reset".into())))
            } else if is_merge(req) {
                (Duration::ZERO, Ok("merged".into()))
            } else {
                (Duration::ZERO, Ok(req.messages[1].content.clone()))
            }
        });
        let stage = ReduceStage::new(
            client(svc, 0),
            WorkerPool::new(1),
            TokenEstimator::new(3),
            merge_budget(300),
            20,
            256,
        );
        let out = stage
            .reduce(
                &ctx(),
                summaries(6, 300),
                6,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.failed_merges, 1);
        assert!(out.text.contains("Merge unavailable"));
    }

    #[tokio::test]
    async fn all_merges_failing_is_total_failure() {
        let svc = ScriptedService::new(|_, req| {
            if is_merge(req) {
                (Duration::ZERO, Err(CompletionError::Transport("down".into())))
            } else {
                (Duration::ZERO, Ok("FINAL".into()))
            }
        });
        let err = stage(svc, 250)
            .reduce(
                &ctx(),
                summaries(6, 300),
                6,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TotalFailure {
                stage: Stage::Reducing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_synthesis_is_total_failure() {
        let svc = ScriptedService::new(|_, _| {
            (Duration::ZERO, Err(CompletionError::InvalidResponse("empty".into())))
        });
        let err = stage(svc, 10_000)
            .reduce(
                &ctx(),
                summaries(2, 30),
                2,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TotalFailure {
                stage: Stage::Reducing,
                failed: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let svc = ScriptedService::ok("FINAL");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = stage(svc.clone(), 10_000)
            .reduce(
                &ctx(),
                summaries(3, 30),
                3,
                &ProgressEmitter::new(&RecordingProgress::new()),
                &cancel,
            )
            .await
            .unwrap();

        assert!(out.cancelled);
        assert_eq!(svc.calls(), 0);
        assert!(out.text.starts_with("000"));
    }
}
